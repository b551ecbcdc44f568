//! Endless randomized discovery over linked trees.
//!
//! [`RandomIterator`] walks every tree it was started with, plus every tree
//! reachable through links, picking a random tree and a random unvisited record
//! at each step. The walk runs in a background task that is only spawned on the
//! first call to [`next`](RandomIterator::next), so an iterator that is closed
//! before use never touches the resolver.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::Client;
use crate::entry::{LinkEntry, LINK_PREFIX};
use crate::record::NodeRecord;
use crate::sync::{ClientTree, LinkCache};

/// Closes a [`RandomIterator`] from anywhere.
///
/// Closing wakes every pending wait of the iterator and its walk task.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Close the iterator. Further calls do nothing.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the iterator was closed.
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    // An error means every sender is gone, which only happens on drop.
    let _ = rx.wait_for(|closed| *closed).await;
}

/// A stream of node records discovered by walking trees at random.
///
/// Records may repeat: once every record of a tree was visited, the walk over
/// that tree starts again.
pub struct RandomIterator {
    current: Option<NodeRecord>,
    walk: Option<RandomWalk>,
    rx: Option<mpsc::Receiver<NodeRecord>>,
    task: Option<JoinHandle<()>>,
    close: CloseHandle,
}

impl RandomIterator {
    pub(crate) fn new(client: Client, locs: Vec<LinkEntry>) -> Self {
        Self {
            current: None,
            walk: Some(RandomWalk::new(client, locs)),
            rx: None,
            task: None,
            close: CloseHandle::new(),
        }
    }

    /// Advance to the next record.
    ///
    /// Returns `false` once the iterator is closed or there is nothing left to walk.
    pub async fn next(&mut self) -> bool {
        if self.close.is_closed() {
            self.current = None;
            return false;
        }
        self.start();
        let Some(rx) = self.rx.as_mut() else {
            self.current = None;
            return false;
        };
        let mut closed = self.close.subscribe();
        let node = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => None,
            node = rx.recv() => node,
        };
        self.current = node;
        self.current.is_some()
    }

    /// The record found by the last successful [`next`](Self::next).
    pub fn node(&self) -> Option<&NodeRecord> {
        self.current.as_ref()
    }

    /// Stop the walk and wake any pending [`next`](Self::next).
    pub fn close(&self) {
        self.close.close();
    }

    /// A handle that closes this iterator from another task or thread.
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    fn start(&mut self) {
        let Some(mut walk) = self.walk.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(1);
        let mut closed = self.close.subscribe();
        self.task = Some(tokio::spawn(async move {
            loop {
                let node = tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed) => break,
                    node = walk.next_node() => node,
                };
                let Some(node) = node else {
                    break;
                };
                tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed) => break,
                    sent = tx.send(node) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("random walk stopped");
        }));
        self.rx = Some(rx);
    }
}

impl Stream for RandomIterator {
    type Item = NodeRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.close.is_closed() {
            return Poll::Ready(None);
        }
        this.start();
        match this.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for RandomIterator {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// State of the background walk.
struct RandomWalk {
    client: Client,
    links: LinkCache,
    trees: HashMap<String, ClientTree>,
    rng: StdRng,
}

impl RandomWalk {
    fn new(client: Client, locs: Vec<LinkEntry>) -> Self {
        let mut links = LinkCache::default();
        for loc in &locs {
            links.add_link("", &loc.location);
        }
        Self {
            client,
            links,
            trees: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Walk until a record turns up. `None` when no trees are left.
    async fn next_node(&mut self) -> Option<NodeRecord> {
        loop {
            // Lookups may complete without ever suspending, so give the
            // runtime and the close signal a turn on every step.
            tokio::task::yield_now().await;
            let location = self.pick_tree().await?;
            let Some(tree) = self.trees.get_mut(&location) else {
                continue;
            };
            match tree.sync_random(&self.client, &mut self.links, &mut self.rng).await {
                Ok(Some(node)) => return Some(node),
                Ok(None) => {}
                Err(err) => debug!(tree = %tree.loc().domain, %err, "error in DNS random node sync"),
            }
        }
    }

    async fn pick_tree(&mut self) -> Option<String> {
        if self.links.take_changed() {
            self.rebuild_trees();
        }
        loop {
            let picked = {
                let syncable: Vec<&String> = self
                    .trees
                    .iter()
                    .filter(|(_, tree)| tree.can_sync_random())
                    .map(|(location, _)| location)
                    .collect();
                syncable.choose(&mut self.rng).map(|location| (*location).clone())
            };
            if picked.is_some() {
                return picked;
            }
            // Nothing to do until a root is due again.
            let next = self
                .trees
                .values()
                .map(ClientTree::next_wakeup)
                .min()?;
            trace!(trees = self.trees.len(), "waiting for root updates");
            tokio::time::sleep_until(next).await;
        }
    }

    fn rebuild_trees(&mut self) {
        let links = &self.links;
        self.trees.retain(|location, _| links.is_referenced(location));

        let added: Vec<String> = self
            .links
            .locations()
            .filter(|location| !self.trees.contains_key(*location))
            .cloned()
            .collect();
        let recheck = self.client.config().recheck_interval;
        for location in added {
            match LinkEntry::parse(&format!("{LINK_PREFIX}{location}")) {
                Ok(loc) => {
                    self.trees.insert(location, ClientTree::new(loc, recheck));
                }
                Err(err) => debug!(%location, %err, "skipping unparsable link"),
            }
        }
    }
}
