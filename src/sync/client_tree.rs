use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use super::{LinkCache, SubtreeSync};
use crate::client::Client;
use crate::entry::{Entry, LinkEntry, RootEntry};
use crate::error::Result;
use crate::record::NodeRecord;

/// Leaf failures after which the root is checked again early.
const ROOT_RECHECK_FAIL_COUNT: u32 = 5;

/// Delay before retrying a record subtree whose last round found no leaves.
const EMPTY_ROUND_RETRY: Duration = Duration::from_secs(5);

/// Sync state of one remote tree.
#[derive(Debug)]
pub(crate) struct ClientTree {
    loc: LinkEntry,
    recheck_interval: Duration,
    last_root_check: Option<Instant>,
    /// Set when a round ended without leaves because of failures.
    enr_retry_at: Option<Instant>,
    leaf_fail_count: u32,
    root_fail_count: u32,
    root: Option<RootEntry>,
    enrs: SubtreeSync,
    links: SubtreeSync,
    cur_links: HashSet<String>,
    link_gc_root: String,
}

impl ClientTree {
    pub(crate) fn new(loc: LinkEntry, recheck_interval: Duration) -> Self {
        Self {
            enrs: SubtreeSync::empty(&loc.domain, false),
            links: SubtreeSync::empty(&loc.domain, true),
            loc,
            recheck_interval,
            last_root_check: None,
            enr_retry_at: None,
            leaf_fail_count: 0,
            root_fail_count: 0,
            root: None,
            cur_links: HashSet::new(),
            link_gc_root: String::new(),
        }
    }

    pub(crate) fn loc(&self) -> &LinkEntry {
        &self.loc
    }

    /// Resolve the root and then every entry, links first.
    pub(crate) async fn sync_all(
        &mut self,
        client: &Client,
        dest: &mut BTreeMap<String, Entry>,
        budget: &mut usize,
    ) -> Result<RootEntry> {
        let root = self.update_root(client).await?;
        self.links.resolve_all(client, dest, budget).await?;
        self.enrs.resolve_all(client, dest, budget).await?;
        Ok(root)
    }

    /// Perform one step of the random walk.
    ///
    /// Returns a record when the step resolved a leaf of the record subtree.
    pub(crate) async fn sync_random<R: Rng>(
        &mut self,
        client: &Client,
        links: &mut LinkCache,
        rng: &mut R,
    ) -> Result<Option<NodeRecord>> {
        if self.root_update_due() {
            self.update_root(client).await?;
        }
        let result = self.sync_leaf(client, links, rng).await;
        if result.is_err() {
            self.leaf_fail_count += 1;
        }
        result
    }

    async fn sync_leaf<R: Rng>(
        &mut self,
        client: &Client,
        links: &mut LinkCache,
        rng: &mut R,
    ) -> Result<Option<NodeRecord>> {
        // The link subtree is synced to completion before any record.
        if !self.links.done() {
            self.sync_next_link(client, links).await?;
            return Ok(None);
        }
        self.gc_links(links);

        if self.enrs.done() {
            self.enrs.restart();
            self.enr_retry_at = None;
        }
        let result = self.sync_next_random_enr(client, rng).await;
        if result.is_err() && self.enrs.done() && self.enrs.leaves == 0 {
            self.enr_retry_at = Some(Instant::now() + EMPTY_ROUND_RETRY);
        }
        result
    }

    /// Whether a call to [`sync_random`](Self::sync_random) can make progress.
    ///
    /// A fully synced tree without leaves cannot, until its root is due again
    /// or a failed round is retried.
    pub(crate) fn can_sync_random(&self) -> bool {
        self.root_update_due()
            || !self.links.done()
            || !self.enrs.done()
            || self.enrs.leaves != 0
            || self.enr_retry_at.is_some_and(|at| Instant::now() >= at)
    }

    fn gc_links(&mut self, links: &mut LinkCache) {
        let Some(root) = &self.root else {
            return;
        };
        if !self.links.done() || root.lroot == self.link_gc_root {
            return;
        }
        links.reset_links(&self.loc.location, &self.cur_links);
        self.link_gc_root = root.lroot.clone();
    }

    async fn sync_next_link(&mut self, client: &Client, links: &mut LinkCache) -> Result<()> {
        let Some(hash) = self.links.missing.front().cloned() else {
            return Ok(());
        };
        let entry = self.links.resolve_next(client, &hash).await?;
        self.links.missing.pop_front();
        if let Entry::Link(dest) = entry {
            links.add_link(&self.loc.location, &dest.location);
            self.cur_links.insert(dest.location);
        }
        Ok(())
    }

    /// Resolve a random missing entry of the record subtree.
    ///
    /// An entry that fails is dropped for the rest of the round and retried
    /// after the next restart.
    async fn sync_next_random_enr<R: Rng>(
        &mut self,
        client: &Client,
        rng: &mut R,
    ) -> Result<Option<NodeRecord>> {
        if self.enrs.missing.is_empty() {
            return Ok(None);
        }
        let index = rng.gen_range(0..self.enrs.missing.len());
        let hash = self.enrs.missing[index].clone();
        let entry = self.enrs.resolve_next(client, &hash).await;
        self.enrs.missing.swap_remove_back(index);
        match entry? {
            Entry::Record(record) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    async fn update_root(&mut self, client: &Client) -> Result<RootEntry> {
        if let Some(delay) = self.root_slowdown() {
            debug!(tree = %self.loc.domain, failures = self.root_fail_count, ?delay, "slowing down root updates");
            tokio::time::sleep(delay).await;
        }
        self.last_root_check = Some(Instant::now());

        let root = match client.resolve_root(&self.loc).await {
            Ok(root) => root,
            Err(err) => {
                self.root_fail_count += 1;
                return Err(err);
            }
        };
        self.root_fail_count = 0;
        self.leaf_fail_count = 0;

        if root.lroot != self.links.root {
            self.links = SubtreeSync::new(&self.loc.domain, root.lroot.clone(), true);
            self.cur_links.clear();
        }
        if root.eroot != self.enrs.root {
            self.enrs = SubtreeSync::new(&self.loc.domain, root.eroot.clone(), false);
        }
        self.root = Some(root.clone());
        Ok(root)
    }

    fn root_slowdown(&self) -> Option<Duration> {
        match self.root_fail_count {
            n if n > 20 => Some(Duration::from_secs(10)),
            n if n > 5 => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    fn root_update_due(&self) -> bool {
        self.root.is_none()
            || self.leaf_fail_count > ROOT_RECHECK_FAIL_COUNT
            || Instant::now() >= self.next_scheduled_root_check()
    }

    /// When the root is next due for a scheduled check.
    fn next_scheduled_root_check(&self) -> Instant {
        match self.last_root_check {
            Some(last) => last + self.recheck_interval,
            None => Instant::now(),
        }
    }

    /// When [`can_sync_random`](Self::can_sync_random) next turns true by itself.
    pub(crate) fn next_wakeup(&self) -> Instant {
        let root_check = self.next_scheduled_root_check();
        match self.enr_retry_at {
            Some(at) => at.min(root_check),
            None => root_check,
        }
    }
}
