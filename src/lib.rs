//! Node discovery through signed Merkle trees published as DNS TXT records.
//!
//! A publisher packs node records and links to other trees into a [`Tree`], signs
//! its root and publishes [`Tree::to_txt`] in a DNS zone. A [`Client`] resolves the
//! tree again, checking every entry against its hash and the root against the key
//! in the tree URL, either all at once with [`Client::sync_tree`] or as an endless
//! random walk with [`Client::new_iterator`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use enrtree::{Client, Config, MapResolver};
//!
//! # async fn run() -> enrtree::Result<()> {
//! let resolver = Arc::new(MapResolver::new());
//! let client = Client::new(Config::new(resolver).rate_limit(10));
//! let mut it = client.new_iterator(["enrtree://AKPYQIUQIL7PSIACI32J7FGZW56E5FKHEFCCOFHILBIMW3M6LWXS2@nodes.example.org"])?;
//! while it.next().await {
//!     if let Some(node) = it.node() {
//!         println!("{}", node.id());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod client;
pub mod entry;
pub mod error;
pub mod iterator;
pub mod record;
pub mod resolver;
mod sync;
pub mod tree;

// Re-export key types
pub use cache::{ResolutionCache, RootUpdate};
pub use client::{Client, Config};
pub use entry::{BranchEntry, Entry, LinkEntry, RootEntry};
pub use error::{EntryError, EntryErrorKind, Error, ResolveError, Result};
pub use iterator::{CloseHandle, RandomIterator};
pub use record::{NodeId, NodeRecord, RecordBuilder, RecordError};
pub use resolver::{MapResolver, Resolver};
pub use tree::Tree;

pub use k256::ecdsa::{SigningKey, VerifyingKey};
