//! Client for resolving and syncing trees published in DNS.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use data_encoding::BASE32_NOPAD;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use sha3::{Digest, Keccak256};
use tracing::{debug, trace, warn};

use crate::cache::{ResolutionCache, RootUpdate};
use crate::entry::{Entry, LinkEntry, RootEntry, ROOT_PREFIX};
use crate::error::{Error, ResolveError, Result};
use crate::iterator::RandomIterator;
use crate::resolver::Resolver;
use crate::sync::ClientTree;
use crate::tree::Tree;

/// Burst size of the lookup rate limiter.
const RATE_BURST: u32 = 10;

/// Client configuration.
#[derive(Clone)]
pub struct Config {
    /// TXT lookup backend.
    pub resolver: Arc<dyn Resolver>,
    /// Timeout of a single DNS lookup. Default: 5s.
    pub timeout: Duration,
    /// Time between root checks of a tree. Default: 30min.
    pub recheck_interval: Duration,
    /// Capacity of the private entry cache. Default: 1000.
    pub cache_limit: usize,
    /// Lifetime of cached entries. Default: 30min.
    pub cache_ttl: Duration,
    /// Maximum lookups per second, `None` for no limit. Default: `None`.
    pub rate_limit: Option<u32>,
    /// Maximum entry resolutions per sync pass. Default: 100000.
    pub max_entries: usize,
    /// Cache shared with other clients. Default: a private one.
    pub cache: Option<Arc<ResolutionCache>>,
}

impl Config {
    /// Create a configuration with default settings.
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            timeout: Duration::from_secs(5),
            recheck_interval: Duration::from_secs(30 * 60),
            cache_limit: 1000,
            cache_ttl: Duration::from_secs(30 * 60),
            rate_limit: None,
            max_entries: 100_000,
            cache: None,
        }
    }

    /// Set the per-lookup timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the root recheck interval.
    pub fn recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    /// Set the private cache capacity.
    pub fn cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = limit;
        self
    }

    /// Set the cache lifetime of entries.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Limit lookups to `per_second`. Zero disables the limit.
    pub fn rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = Some(per_second).filter(|n| *n > 0);
        self
    }

    /// Set the resolution budget of a sync pass.
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Use a cache shared with other clients.
    pub fn with_cache(mut self, cache: Arc<ResolutionCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("timeout", &self.timeout)
            .field("recheck_interval", &self.recheck_interval)
            .field("cache_limit", &self.cache_limit)
            .field("cache_ttl", &self.cache_ttl)
            .field("rate_limit", &self.rate_limit)
            .field("max_entries", &self.max_entries)
            .field("shared_cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

/// Discovers nodes by resolving trees from DNS.
///
/// Cloning is cheap; clones share the cache and the rate limiter.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    cache: Arc<ResolutionCache>,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client.
    pub fn new(config: Config) -> Self {
        let cache = config
            .cache
            .clone()
            .unwrap_or_else(|| Arc::new(ResolutionCache::new(config.cache_limit)));
        let limiter = config.rate_limit.and_then(NonZeroU32::new).map(|rate| {
            let burst = NonZeroU32::new(RATE_BURST).unwrap_or(NonZeroU32::MIN);
            RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))
        });
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                limiter,
            }),
        }
    }

    /// The client configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The entry cache in use.
    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.inner.cache
    }

    /// Download the whole tree at `url`.
    ///
    /// The link subtree is resolved before the record subtree. Links are listed in
    /// the result but not followed; see [`sync_linked`](Self::sync_linked).
    pub async fn sync_tree(&self, url: &str) -> Result<Tree> {
        let loc = parse_url(url)?;
        let mut budget = self.config().max_entries;
        self.sync_location(loc, &mut budget).await
    }

    /// Download the tree at `url` and every tree reachable through its links.
    ///
    /// Each domain is synced once. All trees share one resolution budget.
    pub async fn sync_linked(&self, url: &str) -> Result<BTreeMap<String, Tree>> {
        let start = parse_url(url)?;
        let mut budget = self.config().max_entries;
        let mut visited = HashSet::from([start.domain.clone()]);
        let mut queue = VecDeque::from([start]);
        let mut trees = BTreeMap::new();

        while let Some(loc) = queue.pop_front() {
            let domain = loc.domain.clone();
            let tree = self.sync_location(loc, &mut budget).await?;
            for link in tree.link_entries() {
                if visited.insert(link.domain.clone()) {
                    queue.push_back(link.clone());
                }
            }
            debug!(tree = %domain, entries = tree.len(), "synced linked tree");
            trees.insert(domain, tree);
        }
        Ok(trees)
    }

    async fn sync_location(&self, loc: LinkEntry, budget: &mut usize) -> Result<Tree> {
        let mut ct = ClientTree::new(loc, self.config().recheck_interval);
        let mut entries = BTreeMap::new();
        let root = ct.sync_all(self, &mut entries, budget).await?;
        Ok(Tree::from_parts(root, entries))
    }

    /// Create an iterator that walks the trees at `urls` and everything they link to.
    pub fn new_iterator<I, S>(&self, urls: I) -> Result<RandomIterator>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let locs = urls
            .into_iter()
            .map(|url| parse_url(url.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(RandomIterator::new(self.clone(), locs))
    }

    /// Resolve and verify the root of the tree at `loc`.
    ///
    /// The returned root is signed by the key of `loc` and never has a lower
    /// sequence number than one this client (or any client sharing its cache)
    /// accepted before for the same key and domain.
    pub async fn resolve_root(&self, loc: &LinkEntry) -> Result<RootEntry> {
        let domain = loc.domain.as_str();
        let txts = self.lookup(domain).await;
        trace!(tree = %domain, err = ?txts.as_ref().err(), "updating DNS discovery root");
        let txts = txts.map_err(|e| Error::name(domain, e))?;

        let text = txts
            .iter()
            .find(|t| t.starts_with(ROOT_PREFIX))
            .ok_or_else(|| Error::name(domain, Error::NoRoot))?;
        let root = RootEntry::parse_and_verify(text, &loc.public_key)
            .map_err(|e| Error::name(domain, e))?;

        match self.cache().update_root(loc, &root) {
            RootUpdate::New => {
                debug!(tree = %domain, seq = root.seq, "new tree root");
                Ok(root)
            }
            RootUpdate::Advanced { previous } => {
                debug!(tree = %domain, seq = root.seq, previous, "tree root updated");
                Ok(root)
            }
            RootUpdate::Unchanged => Ok(self.cache().root(loc).unwrap_or(root)),
            RootUpdate::Stale { current } => {
                warn!(tree = %domain, seq = root.seq, current, "ignoring root with lower sequence number");
                Ok(self.cache().root(loc).unwrap_or(root))
            }
        }
    }

    /// Resolve the entry published at `hash.domain`.
    ///
    /// Waits on the rate limiter first, even when the entry is cached.
    pub async fn resolve_entry(&self, domain: &str, hash: &str) -> Result<Entry> {
        if let Some(limiter) = &self.inner.limiter {
            limiter.until_ready().await;
        }
        if let Some(entry) = self.cache().get(domain, hash) {
            return Ok(entry);
        }
        let entry = self.fetch_entry(domain, hash).await?;
        self.cache()
            .put(domain, hash, entry.clone(), self.config().cache_ttl);
        Ok(entry)
    }

    async fn fetch_entry(&self, domain: &str, hash: &str) -> Result<Entry> {
        let name = format!("{hash}.{domain}");
        let want = BASE32_NOPAD
            .decode(hash.as_bytes())
            .map_err(|_| Error::name(&name, Error::InvalidHash(hash.to_owned())))?;
        let txts = self.lookup(&name).await;
        trace!(%name, err = ?txts.as_ref().err(), "resolving DNS discovery entry");
        let txts = txts.map_err(|e| Error::name(&name, e))?;

        for txt in txts {
            if txt.starts_with(ROOT_PREFIX) {
                continue;
            }
            let parsed = match Entry::parse(&txt) {
                Err(Error::UnknownEntry) => continue,
                parsed => parsed,
            };
            if !Keccak256::digest(txt.as_bytes()).starts_with(&want) {
                return Err(Error::name(name, Error::HashMismatch));
            }
            return parsed.map_err(|e| Error::name(name, e));
        }
        Err(Error::name(name, Error::NoEntry))
    }

    async fn lookup(&self, name: &str) -> std::result::Result<Vec<String>, ResolveError> {
        let resolver = &self.config().resolver;
        tokio::time::timeout(self.config().timeout, resolver.lookup_txt(name))
            .await
            .map_err(|_| ResolveError::Timeout)?
    }
}

fn parse_url(url: &str) -> Result<LinkEntry> {
    LinkEntry::parse(url).map_err(|e| Error::InvalidUrl(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EntryError, EntryErrorKind};
    use crate::resolver::MapResolver;
    use k256::ecdsa::SigningKey;

    fn client(resolver: Arc<MapResolver>) -> Client {
        Client::new(Config::new(resolver))
    }

    fn signed_tree(seq: u64, key: &SigningKey, domain: &str) -> (Tree, String) {
        let mut tree = Tree::make(seq, &[], &[]).unwrap();
        let url = tree.sign(key, domain).unwrap();
        (tree, url)
    }

    #[tokio::test]
    async fn invalid_url_is_reported() {
        let c = client(Arc::new(MapResolver::new()));
        let err = c.sync_tree("https://example.org").await.unwrap_err();
        assert_eq!(
            err,
            Error::InvalidUrl(Box::new(
                EntryError::new("link", EntryErrorKind::Scheme).into()
            ))
        );
    }

    #[tokio::test]
    async fn missing_root_is_named() {
        let resolver = Arc::new(MapResolver::new());
        resolver.add("n", "enrtree-branch:");
        let key = SigningKey::from_slice(&[1; 32]).unwrap();
        let loc = LinkEntry::new("n", key.verifying_key());
        let err = client(resolver).resolve_root(&loc).await.unwrap_err();
        assert_eq!(err, Error::name("n", Error::NoRoot));
    }

    #[tokio::test]
    async fn hash_mismatch_is_detected() {
        let resolver = Arc::new(MapResolver::new());
        let hash = crate::entry::subdomain("enrtree-branch:");
        resolver.add(format!("{hash}.n"), "enrtree-branch:AAAAAAAAAAAAAAAAAAAAAAAAAA");
        let err = client(resolver).resolve_entry("n", &hash).await.unwrap_err();
        assert_eq!(err, Error::name(format!("{hash}.n"), Error::HashMismatch));
    }

    #[tokio::test]
    async fn unknown_texts_are_skipped() {
        let resolver = Arc::new(MapResolver::new());
        let hash = crate::entry::subdomain("enrtree-branch:");
        resolver.add(format!("{hash}.n"), "v=spf1 -all");
        resolver.add(format!("{hash}.n"), "enrtree-branch:");
        let c = client(resolver.clone());
        let entry = c.resolve_entry("n", &hash).await.unwrap();
        assert_eq!(entry.to_string(), "enrtree-branch:");

        // Served from the cache the second time.
        c.resolve_entry("n", &hash).await.unwrap();
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn lower_sequence_keeps_cached_root() {
        let key = SigningKey::from_slice(&[2; 32]).unwrap();
        let (newer, url) = signed_tree(5, &key, "n");
        let (older, _) = signed_tree(4, &key, "n");
        let loc = LinkEntry::parse(&url).unwrap();

        let resolver = Arc::new(MapResolver::from(newer.to_txt("n")));
        let c = client(resolver.clone());
        assert_eq!(c.resolve_root(&loc).await.unwrap().seq, 5);

        resolver.clear();
        resolver.extend(older.to_txt("n"));
        assert_eq!(c.resolve_root(&loc).await.unwrap().seq, 5);
    }

    #[tokio::test]
    async fn wrong_key_fails_root_verification() {
        let key = SigningKey::from_slice(&[3; 32]).unwrap();
        let other = SigningKey::from_slice(&[4; 32]).unwrap();
        let (tree, _) = signed_tree(1, &key, "n");
        let loc = LinkEntry::new("n", other.verifying_key());
        let c = client(Arc::new(MapResolver::from(tree.to_txt("n"))));
        let err = c.resolve_root(&loc).await.unwrap_err();
        assert_eq!(
            err,
            Error::name("n", EntryError::new("root", EntryErrorKind::InvalidSignature))
        );
    }
}
