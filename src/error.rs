//! Error types for enrtree.

use std::fmt;

use crate::record::RecordError;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed entry text.
    #[error(transparent)]
    Entry(#[from] EntryError),

    /// Failure while resolving a specific DNS name.
    #[error("{}", name_error_message(.name, .err))]
    Name {
        /// The DNS name being resolved.
        name: String,
        /// What went wrong.
        #[source]
        err: Box<Error>,
    },

    /// TXT text with no recognized entry prefix.
    #[error("unknown entry type")]
    UnknownEntry,

    /// The root domain carries no root entry.
    #[error("no valid root found")]
    NoRoot,

    /// The subdomain carries no usable tree entry.
    #[error("no valid tree entry found")]
    NoEntry,

    /// The entry text does not hash to its subdomain label.
    #[error("hash mismatch")]
    HashMismatch,

    /// A record entry was found while syncing a link subtree.
    #[error("enr entry in link tree")]
    EnrInLinkTree,

    /// A link entry was found while syncing a record subtree.
    #[error("link entry in ENR tree")]
    LinkInEnrTree,

    /// The label to resolve is not a valid entry hash.
    #[error("invalid base32 hash {0:?}")]
    InvalidHash(String),

    /// A sync pass exceeded its resolution budget.
    #[error("too many entries: sync exceeded limit of {0}")]
    TooManyEntries(usize),

    /// An entry is too large to publish in a TXT record.
    #[error("{typ} entry too large: {len} bytes exceeds {max}")]
    EntryTooLarge {
        /// Entry type.
        typ: &'static str,
        /// Encoded length.
        len: usize,
        /// Allowed length.
        max: usize,
    },

    /// A tree URL could not be parsed.
    #[error("invalid enrtree URL: {0}")]
    InvalidUrl(Box<Error>),

    /// Producing a signature failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Resolver failure.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl Error {
    /// Wrap an error with the DNS name it occurred at.
    pub fn name<S: Into<String>>(name: S, err: impl Into<Error>) -> Self {
        Self::Name {
            name: name.into(),
            err: Box::new(err.into()),
        }
    }

    /// The innermost error, with all name wrappers removed.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Name { err, .. } => err.root_cause(),
            Self::InvalidUrl(err) => err.root_cause(),
            other => other,
        }
    }
}

fn name_error_message(name: &str, err: &Error) -> String {
    match err {
        Error::Entry(e) => format!("invalid {} entry at {}: {}", e.typ, name, e.err),
        other => format!("{name}: {other}"),
    }
}

/// A malformed entry of a given type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {typ} entry: {err}")]
pub struct EntryError {
    /// Entry type: "root", "branch", "link" or "enr".
    pub typ: &'static str,
    /// What is wrong with it.
    pub err: EntryErrorKind,
}

impl EntryError {
    /// Create an entry error.
    pub fn new(typ: &'static str, err: EntryErrorKind) -> Self {
        Self { typ, err }
    }
}

/// Reasons an entry fails to parse or verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryErrorKind {
    /// Link text lacks the public key part.
    NoPubkey,
    /// Link public key does not decode.
    BadPubkey,
    /// Record text is not valid base64.
    InvalidEnr,
    /// A child hash is malformed.
    InvalidChild,
    /// Root signature is not valid base64 of the right length.
    InvalidSig,
    /// Root signature does not verify against the expected key.
    InvalidSignature,
    /// Text does not follow the entry grammar.
    Syntax,
    /// URL does not use the enrtree scheme.
    Scheme,
    /// The node record itself was rejected.
    Record(RecordError),
}

impl fmt::Display for EntryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPubkey => f.write_str("missing public key"),
            Self::BadPubkey => f.write_str("invalid public key"),
            Self::InvalidEnr => f.write_str("invalid node record"),
            Self::InvalidChild => f.write_str("invalid child hash"),
            Self::InvalidSig => f.write_str("invalid base64 signature"),
            Self::InvalidSignature => f.write_str("invalid signature"),
            Self::Syntax => f.write_str("invalid syntax"),
            Self::Scheme => f.write_str("wrong/missing scheme 'enrtree' in URL"),
            Self::Record(e) => e.fmt(f),
        }
    }
}

/// Errors reported by a [`Resolver`](crate::resolver::Resolver).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The name has no TXT records.
    #[error("not found")]
    NotFound,

    /// The lookup did not finish within the configured timeout.
    #[error("lookup timed out")]
    Timeout,

    /// Transport or server failure.
    #[error("DNS error: {0}")]
    Transport(String),
}

impl ResolveError {
    /// Create a transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }
}
