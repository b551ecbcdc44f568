//! Tree entries and their TXT text encoding.
//!
//! Every entry of a tree is published as one TXT record. Non-root entries live at
//! `<hash>.<domain>`, where the hash is derived from the entry text itself, so a
//! resolved record can be checked against the name it was found at.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use data_encoding::BASE32_NOPAD;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::{EntryError, EntryErrorKind, Error, Result};
use crate::record::NodeRecord;

/// Prefix of the signed root entry.
pub const ROOT_PREFIX: &str = "enrtree-root:v1";
/// Prefix of link entries and tree URLs.
pub const LINK_PREFIX: &str = "enrtree://";
/// Prefix of branch entries.
pub const BRANCH_PREFIX: &str = "enrtree-branch:";
/// Prefix of node record entries.
pub const ENR_PREFIX: &str = "enr:";

/// Length of a root signature (r, s, recovery id).
pub const SIGNATURE_LENGTH: usize = 65;

/// Hashes shorter than this many decoded bytes are rejected.
pub const MIN_HASH_LENGTH: usize = 12;

const HASH_LENGTH: usize = 16;

/// Compute the subdomain label of an entry text.
pub fn subdomain(text: &str) -> String {
    let digest = Keccak256::digest(text.as_bytes());
    BASE32_NOPAD.encode(&digest[..HASH_LENGTH])
}

/// Check whether `s` is a well-formed entry hash.
pub fn is_valid_hash(s: &str) -> bool {
    if s.contains(['\n', '\r']) {
        return false;
    }
    let decoded_len = s.len() * 5 / 8;
    if !(MIN_HASH_LENGTH..=32).contains(&decoded_len) {
        return false;
    }
    BASE32_NOPAD.decode(s.as_bytes()).is_ok()
}

/// Encode a public key the way links and URLs carry it.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    BASE32_NOPAD.encode(key.to_encoded_point(true).as_bytes())
}

/// A parsed tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Signed tree root.
    Root(RootEntry),
    /// Inner node.
    Branch(BranchEntry),
    /// Reference to another tree.
    Link(LinkEntry),
    /// Leaf carrying a node record.
    Record(NodeRecord),
}

impl Entry {
    /// Parse an entry from its TXT text.
    pub fn parse(text: &str) -> Result<Self> {
        if text.starts_with(ROOT_PREFIX) {
            RootEntry::parse(text).map(Entry::Root)
        } else if text.starts_with(LINK_PREFIX) {
            LinkEntry::parse(text).map(Entry::Link)
        } else if let Some(rest) = text.strip_prefix(BRANCH_PREFIX) {
            BranchEntry::parse_children(rest).map(Entry::Branch)
        } else if let Some(rest) = text.strip_prefix(ENR_PREFIX) {
            parse_record(rest).map(Entry::Record)
        } else {
            Err(Error::UnknownEntry)
        }
    }

    /// Subdomain label under which this entry is published.
    pub fn hash(&self) -> String {
        subdomain(&self.to_string())
    }

    /// Short type name, as used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Entry::Root(_) => "root",
            Entry::Branch(_) => "branch",
            Entry::Link(_) => "link",
            Entry::Record(_) => "enr",
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Root(e) => fmt::Display::fmt(e, f),
            Entry::Branch(e) => fmt::Display::fmt(e, f),
            Entry::Link(e) => fmt::Display::fmt(e, f),
            Entry::Record(r) => write!(f, "{ENR_PREFIX}{}", r.to_base64()),
        }
    }
}

fn parse_record(text: &str) -> Result<NodeRecord> {
    let bytes = URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|_| EntryError::new("enr", EntryErrorKind::InvalidEnr))?;
    NodeRecord::decode(&bytes)
        .map_err(|e| EntryError::new("enr", EntryErrorKind::Record(e)).into())
}

/// The signed root of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    /// Hash of the record subtree root.
    pub eroot: String,
    /// Hash of the link subtree root.
    pub lroot: String,
    /// Update sequence number.
    pub seq: u64,
    /// 65-byte recoverable signature, empty while unsigned.
    pub sig: Vec<u8>,
}

impl RootEntry {
    /// Parse a root entry without checking its signature.
    pub fn parse(text: &str) -> Result<Self> {
        let syntax = || EntryError::new("root", EntryErrorKind::Syntax);
        let rest = text.strip_prefix(ROOT_PREFIX).ok_or_else(syntax)?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let [e, l, seq, sig] = fields.as_slice() else {
            return Err(syntax().into());
        };
        let eroot = e.strip_prefix("e=").ok_or_else(syntax)?;
        let lroot = l.strip_prefix("l=").ok_or_else(syntax)?;
        let seq = seq
            .strip_prefix("seq=")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(syntax)?;
        let sig = sig.strip_prefix("sig=").ok_or_else(syntax)?;

        if !is_valid_hash(eroot) || !is_valid_hash(lroot) {
            return Err(EntryError::new("root", EntryErrorKind::InvalidChild).into());
        }
        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .ok()
            .filter(|s| s.len() == SIGNATURE_LENGTH)
            .ok_or(EntryError::new("root", EntryErrorKind::InvalidSig))?;

        Ok(Self {
            eroot: eroot.to_owned(),
            lroot: lroot.to_owned(),
            seq,
            sig,
        })
    }

    /// Parse a root entry and verify it was signed by `key`.
    pub fn parse_and_verify(text: &str, key: &VerifyingKey) -> Result<Self> {
        let root = Self::parse(text)?;
        if !root.verify_signature(key) {
            return Err(EntryError::new("root", EntryErrorKind::InvalidSignature).into());
        }
        Ok(root)
    }

    /// The signed part of the root text.
    pub fn signing_text(&self) -> String {
        format!(
            "{ROOT_PREFIX} e={} l={} seq={}",
            self.eroot, self.lroot, self.seq
        )
    }

    /// Keccak-256 of [`signing_text`](Self::signing_text).
    pub fn sig_hash(&self) -> [u8; 32] {
        Keccak256::digest(self.signing_text().as_bytes()).into()
    }

    /// Check the signature against `key`.
    pub fn verify_signature(&self, key: &VerifyingKey) -> bool {
        if self.sig.len() != SIGNATURE_LENGTH {
            return false;
        }
        match Signature::from_slice(&self.sig[..64]) {
            Ok(sig) => key.verify_prehash(&self.sig_hash(), &sig).is_ok(),
            Err(_) => false,
        }
    }

    /// Recover the signer's key from the signature.
    pub fn recover_signer(&self) -> Option<VerifyingKey> {
        if self.sig.len() != SIGNATURE_LENGTH {
            return None;
        }
        let sig = Signature::from_slice(&self.sig[..64]).ok()?;
        let recid = RecoveryId::from_byte(self.sig[64])?;
        VerifyingKey::recover_from_prehash(&self.sig_hash(), &sig, recid).ok()
    }
}

impl fmt::Display for RootEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sig={}",
            self.signing_text(),
            URL_SAFE_NO_PAD.encode(&self.sig)
        )
    }
}

/// An inner tree node listing child hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchEntry {
    /// Child hashes in publication order.
    pub children: Vec<String>,
}

impl BranchEntry {
    fn parse_children(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Ok(Self::default());
        }
        let children = text
            .split(',')
            .map(|c| {
                if is_valid_hash(c) {
                    Ok(c.to_owned())
                } else {
                    Err(EntryError::new("branch", EntryErrorKind::InvalidChild))
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { children })
    }
}

impl fmt::Display for BranchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BRANCH_PREFIX}{}", self.children.join(","))
    }
}

/// A reference to another tree: `enrtree://<key>@<domain>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    /// `<key>@<domain>`, the part after the scheme.
    pub location: String,
    /// Domain of the linked tree's root.
    pub domain: String,
    /// Key expected to have signed the linked root.
    pub public_key: VerifyingKey,
}

impl LinkEntry {
    /// Build a link to `domain` signed by `key`.
    pub fn new(domain: &str, key: &VerifyingKey) -> Self {
        Self {
            location: format!("{}@{}", encode_public_key(key), domain),
            domain: domain.to_owned(),
            public_key: *key,
        }
    }

    /// Parse a link entry or tree URL.
    pub fn parse(text: &str) -> Result<Self> {
        let location = text
            .strip_prefix(LINK_PREFIX)
            .ok_or(EntryError::new("link", EntryErrorKind::Scheme))?;
        let (key, domain) = location
            .split_once('@')
            .ok_or(EntryError::new("link", EntryErrorKind::NoPubkey))?;
        let key_bytes = BASE32_NOPAD
            .decode(key.as_bytes())
            .map_err(|_| EntryError::new("link", EntryErrorKind::BadPubkey))?;
        if key_bytes.len() != 33 {
            return Err(EntryError::new("link", EntryErrorKind::BadPubkey).into());
        }
        let public_key = VerifyingKey::from_sec1_bytes(&key_bytes)
            .map_err(|_| EntryError::new("link", EntryErrorKind::BadPubkey))?;
        Ok(Self {
            location: location.to_owned(),
            domain: domain.to_owned(),
            public_key,
        })
    }
}

impl fmt::Display for LinkEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{LINK_PREFIX}{}", self.location)
    }
}
