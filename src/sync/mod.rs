//! Incremental tree synchronization.
//!
//! A [`ClientTree`] tracks the sync state of one remote tree: its current root and
//! a [`SubtreeSync`] for each of the link and record subtrees. Whole-tree syncs
//! drain both subtrees in order; the random walk instead advances one entry at a
//! time and uses the [`LinkCache`] to learn which trees are still referenced.

mod client_tree;
mod links;
mod subtree;

pub(crate) use client_tree::ClientTree;
pub(crate) use links::LinkCache;
pub(crate) use subtree::SubtreeSync;
