//! Shared cache of resolved entries and per-tree root state.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::entry::{Entry, LinkEntry, RootEntry};

/// Outcome of [`ResolutionCache::update_root`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootUpdate {
    /// First root seen for the tree.
    New,
    /// Same sequence as the cached root.
    Unchanged,
    /// Higher sequence; cached entries of the domain were dropped.
    Advanced {
        /// Sequence of the replaced root.
        previous: u64,
    },
    /// Lower sequence; the cached root was kept.
    Stale {
        /// Sequence of the kept root.
        current: u64,
    },
}

#[derive(Debug)]
struct CachedEntry {
    entry: Entry,
    domain: String,
    expires: Instant,
}

#[derive(Debug)]
struct State {
    entries: LruCache<String, CachedEntry>,
    /// Accepted roots by tree location (`key@domain`).
    roots: LruCache<String, RootEntry>,
}

/// Bounded LRU cache of tree entries, keyed by `hash.domain`.
///
/// Roots are remembered per tree location, so a root accepted under one
/// public key is never handed out for a link naming another key. Root state is
/// bounded by the same capacity; an evicted root is accepted again at any
/// sequence number.
///
/// Safe to share between clients through an `Arc`.
#[derive(Debug)]
pub struct ResolutionCache {
    state: Mutex<State>,
}

impl ResolutionCache {
    /// Create a cache holding at most `capacity` entries and `capacity` roots.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                roots: LruCache::new(capacity),
            }),
        }
    }

    /// Look up an unexpired entry.
    pub fn get(&self, domain: &str, hash: &str) -> Option<Entry> {
        let key = cache_key(domain, hash);
        let mut state = self.state.lock();
        let expired = match state.entries.get(&key) {
            Some(cached) if cached.expires > Instant::now() => return Some(cached.entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.pop(&key);
        }
        None
    }

    /// Store an entry resolved at `hash.domain` for `ttl`.
    pub fn put(&self, domain: &str, hash: &str, entry: Entry, ttl: Duration) {
        let cached = CachedEntry {
            entry,
            domain: domain.to_owned(),
            expires: Instant::now() + ttl,
        };
        self.state.lock().entries.put(cache_key(domain, hash), cached);
    }

    /// Drop every cached entry of `domain`, returning how many were removed.
    pub fn invalidate_root(&self, domain: &str) -> usize {
        drop_domain(&mut self.state.lock().entries, domain)
    }

    /// The last accepted root of the tree at `loc`.
    pub fn root(&self, loc: &LinkEntry) -> Option<RootEntry> {
        self.state.lock().roots.get(&loc.location).cloned()
    }

    /// Record a root freshly verified against `loc`, refusing to go back in sequence.
    ///
    /// A higher sequence replaces the stored root and drops the cached entries
    /// of the tree's domain. A lower or equal sequence leaves the stored root in
    /// place.
    pub fn update_root(&self, loc: &LinkEntry, root: &RootEntry) -> RootUpdate {
        let mut state = self.state.lock();
        let previous = match state.roots.get(&loc.location) {
            None => None,
            Some(current) if current.seq == root.seq => return RootUpdate::Unchanged,
            Some(current) if current.seq > root.seq => {
                return RootUpdate::Stale {
                    current: current.seq,
                }
            }
            Some(current) => Some(current.seq),
        };
        state.roots.put(loc.location.clone(), root.clone());
        let Some(previous) = previous else {
            return RootUpdate::New;
        };
        drop_domain(&mut state.entries, &loc.domain);
        RootUpdate::Advanced { previous }
    }

    /// Number of cached entries, expired ones included.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn drop_domain(entries: &mut LruCache<String, CachedEntry>, domain: &str) -> usize {
    let stale: Vec<String> = entries
        .iter()
        .filter(|(_, cached)| cached.domain == domain)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &stale {
        entries.pop(key);
    }
    stale.len()
}

fn cache_key(domain: &str, hash: &str) -> String {
    format!("{hash}.{domain}")
}
