use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::client::Client;
use crate::entry::Entry;
use crate::error::{Error, Result};

/// Resolution state of one subtree (links or records) of a tree.
#[derive(Debug)]
pub(crate) struct SubtreeSync {
    domain: String,
    /// Hash of the subtree root.
    pub(crate) root: String,
    /// Hashes still to resolve, in discovery order.
    pub(crate) missing: VecDeque<String>,
    link: bool,
    /// Leaves resolved in this round.
    pub(crate) leaves: usize,
    resolved: usize,
    seen: HashSet<String>,
}

impl SubtreeSync {
    pub(crate) fn new(domain: &str, root: String, link: bool) -> Self {
        let mut sync = Self {
            domain: domain.to_owned(),
            root,
            missing: VecDeque::new(),
            link,
            leaves: 0,
            resolved: 0,
            seen: HashSet::new(),
        };
        sync.restart();
        sync
    }

    /// A placeholder for a tree whose root is not known yet.
    pub(crate) fn empty(domain: &str, link: bool) -> Self {
        Self {
            domain: domain.to_owned(),
            root: String::new(),
            missing: VecDeque::new(),
            link,
            leaves: 0,
            resolved: 0,
            seen: HashSet::new(),
        }
    }

    pub(crate) fn done(&self) -> bool {
        self.missing.is_empty()
    }

    /// Start a new round from the subtree root.
    pub(crate) fn restart(&mut self) {
        self.missing = VecDeque::from([self.root.clone()]);
        self.seen = HashSet::from([self.root.clone()]);
        self.leaves = 0;
        self.resolved = 0;
    }

    /// Resolve every missing entry into `dest`, spending from `budget`.
    pub(crate) async fn resolve_all(
        &mut self,
        client: &Client,
        dest: &mut BTreeMap<String, Entry>,
        budget: &mut usize,
    ) -> Result<()> {
        while let Some(hash) = self.missing.front().cloned() {
            if *budget == 0 {
                let limit = client.config().max_entries;
                return Err(Error::name(&self.domain, Error::TooManyEntries(limit)));
            }
            *budget -= 1;
            let entry = self.resolve_next(client, &hash).await?;
            dest.insert(hash, entry);
            self.missing.pop_front();
        }
        Ok(())
    }

    /// Resolve `hash` and queue the children it names.
    ///
    /// The caller removes `hash` from `missing` once this succeeds.
    pub(crate) async fn resolve_next(&mut self, client: &Client, hash: &str) -> Result<Entry> {
        let limit = client.config().max_entries;
        if self.resolved >= limit {
            return Err(Error::name(&self.domain, Error::TooManyEntries(limit)));
        }
        let entry = client.resolve_entry(&self.domain, hash).await?;
        self.resolved += 1;

        match &entry {
            Entry::Record(_) if self.link => {
                return Err(Error::name(self.name(hash), Error::EnrInLinkTree));
            }
            Entry::Link(_) if !self.link => {
                return Err(Error::name(self.name(hash), Error::LinkInEnrTree));
            }
            Entry::Record(_) | Entry::Link(_) => self.leaves += 1,
            Entry::Branch(branch) => {
                for child in &branch.children {
                    if self.seen.insert(child.clone()) {
                        self.missing.push_back(child.clone());
                    }
                }
            }
            Entry::Root(_) => {}
        }
        Ok(entry)
    }

    fn name(&self, hash: &str) -> String {
        format!("{hash}.{}", self.domain)
    }
}
