//! The DNS lookup capability the client depends on.
//!
//! The client never talks to DNS directly. Anything that can answer "which TXT
//! strings are published at this name" can back it, so a stub resolver, a
//! system resolver or a zone file loaded into memory all work the same way.
//!
//! ```
//! use enrtree::resolver::{MapResolver, Resolver};
//!
//! # async fn run() -> Result<(), enrtree::ResolveError> {
//! let resolver = MapResolver::new();
//! resolver.add("nodes.example.org", "enrtree-branch:");
//! let txt = resolver.lookup_txt("nodes.example.org").await?;
//! assert_eq!(txt, vec!["enrtree-branch:".to_string()]);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::ResolveError;

/// Looks up TXT records.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Return every TXT string published at `name`.
    ///
    /// Multi-string records are expected to be joined into one string.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, ResolveError>;
}

/// An in-memory resolver over a name → TXT map.
#[derive(Debug, Default)]
pub struct MapResolver {
    records: RwLock<HashMap<String, Vec<String>>>,
    lookups: AtomicUsize,
}

impl MapResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `text` at `name`, next to any text already there.
    pub fn add(&self, name: impl Into<String>, text: impl Into<String>) {
        self.records
            .write()
            .entry(name.into())
            .or_default()
            .push(text.into());
    }

    /// Publish a whole zone, replacing the texts of every name it contains.
    pub fn extend(&self, zone: BTreeMap<String, String>) {
        let mut records = self.records.write();
        for (name, text) in zone {
            records.insert(name, vec![text]);
        }
    }

    /// Remove every record.
    pub fn clear(&self) {
        self.records.write().clear();
    }

    /// Number of lookups served so far, including misses.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl From<BTreeMap<String, String>> for MapResolver {
    fn from(zone: BTreeMap<String, String>) -> Self {
        let resolver = Self::new();
        resolver.extend(zone);
        resolver
    }
}

#[async_trait]
impl Resolver for MapResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, ResolveError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.records
            .read()
            .get(name)
            .cloned()
            .ok_or(ResolveError::NotFound)
    }
}
