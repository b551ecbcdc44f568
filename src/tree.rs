//! Building, signing and exporting discovery trees.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k256::ecdsa::{SigningKey, VerifyingKey};

use crate::entry::{BranchEntry, Entry, LinkEntry, RootEntry, SIGNATURE_LENGTH};
use crate::error::{EntryError, EntryErrorKind, Error, Result};
use crate::record::NodeRecord;

/// Maximum number of children of a branch entry.
pub const MAX_CHILDREN: usize = 13;

/// Maximum text length of a single published entry.
pub const MAX_ENTRY_LEN: usize = 370;

/// A discovery tree: a signed root plus every entry reachable from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    root: RootEntry,
    entries: BTreeMap<String, Entry>,
}

impl Tree {
    /// Build an unsigned tree holding `records` and `links`.
    ///
    /// Records are ordered by node id before being split into branches, so the
    /// same input always yields the same hashes.
    pub fn make(seq: u64, records: &[NodeRecord], links: &[String]) -> Result<Self> {
        let mut records = records.to_vec();
        records.sort_by_key(NodeRecord::id);

        let mut record_entries = Vec::with_capacity(records.len());
        for record in records {
            let entry = Entry::Record(record);
            check_size(&entry)?;
            record_entries.push(entry);
        }
        let mut link_entries = Vec::with_capacity(links.len());
        for link in links {
            let entry = Entry::Link(LinkEntry::parse(link)?);
            check_size(&entry)?;
            link_entries.push(entry);
        }

        let mut tree = Self {
            root: RootEntry {
                eroot: String::new(),
                lroot: String::new(),
                seq,
                sig: Vec::new(),
            },
            entries: BTreeMap::new(),
        };
        let eroot = tree.build(record_entries);
        tree.root.eroot = tree.insert(eroot);
        let lroot = tree.build(link_entries);
        tree.root.lroot = tree.insert(lroot);
        Ok(tree)
    }

    pub(crate) fn from_parts(root: RootEntry, entries: BTreeMap<String, Entry>) -> Self {
        Self { root, entries }
    }

    fn build(&mut self, mut entries: Vec<Entry>) -> Entry {
        if entries.len() == 1 {
            if let Some(entry) = entries.pop() {
                return entry;
            }
        }
        if entries.len() <= MAX_CHILDREN {
            let children = entries.into_iter().map(|e| self.insert(e)).collect();
            return Entry::Branch(BranchEntry { children });
        }
        let mut subtrees = Vec::new();
        while !entries.is_empty() {
            let rest = entries.split_off(entries.len().min(MAX_CHILDREN));
            let chunk = std::mem::replace(&mut entries, rest);
            let sub = self.build(chunk);
            self.insert(sub.clone());
            subtrees.push(sub);
        }
        self.build(subtrees)
    }

    fn insert(&mut self, entry: Entry) -> String {
        let hash = entry.hash();
        self.entries.insert(hash.clone(), entry);
        hash
    }

    /// Sign the root with `key` and return the tree URL for `domain`.
    pub fn sign(&mut self, key: &SigningKey, domain: &str) -> Result<String> {
        let (sig, recid) = key
            .sign_prehash_recoverable(&self.root.sig_hash())
            .map_err(|e| Error::Signing(e.to_string()))?;
        let mut bytes = sig.to_bytes().to_vec();
        bytes.push(recid.to_byte());
        self.root.sig = bytes;
        Ok(LinkEntry::new(domain, key.verifying_key()).to_string())
    }

    /// Attach an externally produced base64 signature.
    ///
    /// The signature is only stored if it verifies against `key`.
    pub fn set_signature(&mut self, key: &VerifyingKey, signature: &str) -> Result<()> {
        let invalid = || EntryError::new("root", EntryErrorKind::InvalidSig);
        let sig = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| invalid())?;
        if sig.len() != SIGNATURE_LENGTH {
            return Err(invalid().into());
        }
        let root = RootEntry {
            sig,
            ..self.root.clone()
        };
        if !root.verify_signature(key) {
            return Err(invalid().into());
        }
        self.root = root;
        Ok(())
    }

    /// Sequence number of the root.
    pub fn seq(&self) -> u64 {
        self.root.seq
    }

    /// Root signature as unpadded URL-safe base64.
    pub fn signature(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.root.sig)
    }

    /// The root entry.
    pub fn root(&self) -> &RootEntry {
        &self.root
    }

    /// Look up an entry by hash.
    pub fn get(&self, hash: &str) -> Option<&Entry> {
        self.entries.get(hash)
    }

    /// Number of non-root entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// URLs of every linked tree.
    pub fn links(&self) -> Vec<String> {
        self.link_entries().map(LinkEntry::to_string).collect()
    }

    pub(crate) fn link_entries(&self) -> impl Iterator<Item = &LinkEntry> {
        self.entries.values().filter_map(|e| match e {
            Entry::Link(link) => Some(link),
            _ => None,
        })
    }

    /// Every node record, ordered by node id.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::Record(record) => Some(record.clone()),
                _ => None,
            })
            .collect();
        nodes.sort_by_key(NodeRecord::id);
        nodes
    }

    /// TXT records to publish under `domain`, keyed by DNS name.
    pub fn to_txt(&self, domain: &str) -> BTreeMap<String, String> {
        let mut records = BTreeMap::new();
        records.insert(domain.to_owned(), self.root.to_string());
        for (hash, entry) in &self.entries {
            let name = if domain.is_empty() {
                hash.clone()
            } else {
                format!("{hash}.{domain}")
            };
            records.insert(name, entry.to_string());
        }
        records
    }
}

fn check_size(entry: &Entry) -> Result<()> {
    let len = entry.to_string().len();
    if len > MAX_ENTRY_LEN {
        return Err(Error::EntryTooLarge {
            typ: entry.kind(),
            len,
            max: MAX_ENTRY_LEN,
        });
    }
    Ok(())
}
