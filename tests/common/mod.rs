#![allow(dead_code)]

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use enrtree::{MapResolver, NodeId, NodeRecord, RandomIterator, RootEntry, SigningKey, Tree};

/// Deterministic signing key.
pub fn test_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

/// `n` distinct signed records derived from `seed`.
pub fn test_nodes(seed: u8, n: usize) -> Vec<NodeRecord> {
    (0..n)
        .map(|i| {
            let mut secret = [seed; 32];
            secret[30..].copy_from_slice(&(i as u16 + 1).to_be_bytes());
            let key = SigningKey::from_slice(&secret).unwrap();
            NodeRecord::builder()
                .seq(1)
                .ip4(Ipv4Addr::new(127, 0, 0, 1))
                .udp(30303 + (i % 1000) as u16)
                .sign(&key)
                .unwrap()
        })
        .collect()
}

/// Build and sign a tree, returning it with its URL.
pub fn signed_tree(
    seq: u64,
    nodes: &[NodeRecord],
    links: &[String],
    key: &SigningKey,
    domain: &str,
) -> (Tree, String) {
    let mut tree = Tree::make(seq, nodes, links).unwrap();
    let url = tree.sign(key, domain).unwrap();
    (tree, url)
}

/// Re-sign a root after editing it.
pub fn sign_root(root: &mut RootEntry, key: &SigningKey) {
    let (sig, recid) = key.sign_prehash_recoverable(&root.sig_hash()).unwrap();
    root.sig = sig.to_bytes().to_vec();
    root.sig.push(recid.to_byte());
}

/// Replace whatever is published under `domain` with `tree`.
pub fn publish(resolver: &MapResolver, tree: &Tree, domain: &str) {
    resolver.extend(tree.to_txt(domain));
}

/// Ids of `nodes`.
pub fn ids(nodes: &[NodeRecord]) -> HashSet<NodeId> {
    nodes.iter().map(NodeRecord::id).collect()
}

/// Check that the iterator yields every node in `want` within 3N steps.
pub async fn check_iterator(it: &mut RandomIterator, want: &[NodeRecord]) {
    let mut missing = ids(want);
    for _ in 0..want.len() * 3 {
        assert!(it.next().await, "iterator ended early");
        let node = it.node().expect("next returned true without a node");
        missing.remove(&node.id());
        if missing.is_empty() {
            return;
        }
    }
    panic!("{} nodes not found after {} steps", missing.len(), want.len() * 3);
}

/// Check that nothing queries `resolver` any more.
pub async fn assert_lookups_settle(resolver: &MapResolver) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let lookups = resolver.lookups();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(resolver.lookups(), lookups, "resolver still in use");
}
