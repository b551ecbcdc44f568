mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{ids, publish, sign_root, signed_tree, test_key, test_nodes};
use enrtree::{
    Client, Config, EntryError, EntryErrorKind, Error, LinkEntry, MapResolver, ResolutionCache,
    ResolveError, Resolver,
};

fn new_client(resolver: Arc<MapResolver>) -> Client {
    Client::new(Config::new(resolver))
}

#[test_log::test(tokio::test)]
async fn sync_tree_reports_bad_node() {
    let resolver = Arc::new(MapResolver::from(BTreeMap::from([
        (
            "n".to_string(),
            "enrtree-root:v1 e=INDMVBZEEQ4ESVYAKGIYU74EAA l=C7HRFPF3BLGF3YR4DY5KX3SMBE seq=3 sig=Vl3AmunLur0JZ3sIyJPSH6A3Vvdp4F40jWQeCmkIhmcgwE4VC5U9wpK8C_uL_CMY29fd6FAhspRvq2z_VysTLAA".to_string(),
        ),
        (
            "C7HRFPF3BLGF3YR4DY5KX3SMBE.n".to_string(),
            "enrtree://AM5FCQLWIZX2QFPNJAP7VUERCCRNGRHWZG3YYHIUV7BVDQ5FDPRT2@morenodes.example.org".to_string(),
        ),
        ("INDMVBZEEQ4ESVYAKGIYU74EAA.n".to_string(), "enr:-----".to_string()),
    ])));
    let client = new_client(resolver);

    let err = client
        .sync_tree("enrtree://AKPYQIUQIL7PSIACI32J7FGZW56E5FKHEFCCOFHILBIMW3M6LWXS2@n")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::name(
            "INDMVBZEEQ4ESVYAKGIYU74EAA.n",
            EntryError::new("enr", EntryErrorKind::InvalidEnr)
        )
    );
    assert_eq!(
        err.to_string(),
        "invalid enr entry at INDMVBZEEQ4ESVYAKGIYU74EAA.n: invalid node record"
    );
}

#[test_log::test(tokio::test)]
async fn sync_tree_reproduces_published_tree() -> anyhow::Result<()> {
    let nodes = test_nodes(1, 30);
    let links = vec![
        LinkEntry::new("a.example.org", test_key(20).verifying_key()).to_string(),
        LinkEntry::new("b.example.org", test_key(21).verifying_key()).to_string(),
    ];
    let (tree, url) = signed_tree(1, &nodes, &links, &test_key(10), "n");
    let resolver = Arc::new(MapResolver::new());
    publish(&resolver, &tree, "n");

    let synced = new_client(resolver.clone()).sync_tree(&url).await?;
    assert_eq!(synced, tree);
    assert_eq!(ids(&synced.nodes()), ids(&nodes));
    assert_eq!(synced.links(), tree.links());
    assert_eq!(synced.seq(), 1);
    // One lookup for the root and one per entry.
    assert_eq!(resolver.lookups(), tree.len() + 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn sync_tree_detects_hash_mismatch() {
    let nodes = test_nodes(2, 3);
    let (tree, url) = signed_tree(1, &nodes, &[], &test_key(11), "n");
    let mut zone = tree.to_txt("n");
    let other = format!("enr:{}", test_nodes(3, 1)[0].to_base64());
    let target = format!("{}.n", enrtree::Entry::Record(nodes[0].clone()).hash());
    zone.insert(target.clone(), other);

    let client = new_client(Arc::new(MapResolver::from(zone)));
    let err = client.sync_tree(&url).await.unwrap_err();
    assert_eq!(err, Error::name(target, Error::HashMismatch));
}

#[test_log::test(tokio::test)]
async fn sync_tree_enforces_entry_budget() {
    let (tree, url) = signed_tree(1, &test_nodes(4, 30), &[], &test_key(12), "n");
    let resolver = Arc::new(MapResolver::from(tree.to_txt("n")));
    let client = Client::new(Config::new(resolver).max_entries(5));

    let err = client.sync_tree(&url).await.unwrap_err();
    assert_eq!(err.root_cause(), &Error::TooManyEntries(5));
}

#[test_log::test(tokio::test)]
async fn link_in_record_tree_is_rejected() -> anyhow::Result<()> {
    let link = LinkEntry::new("other.example.org", test_key(22).verifying_key());
    let (tree, url) = signed_tree(1, &[], &[link.to_string()], &test_key(13), "n");
    // Publish a tree whose record root points at the link entry.
    let mut root = tree.root().clone();
    root.eroot = root.lroot.clone();
    let mut zone = tree.to_txt("n");
    sign_root(&mut root, &test_key(13));
    zone.insert("n".to_string(), root.to_string());

    let err = new_client(Arc::new(MapResolver::from(zone)))
        .sync_tree(&url)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::name(format!("{}.n", root.lroot), Error::LinkInEnrTree)
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn sync_linked_follows_cycles_once() -> anyhow::Result<()> {
    let (key1, key2) = (test_key(30), test_key(31));
    let url1 = LinkEntry::new("t1.example.org", key1.verifying_key()).to_string();
    let url2 = LinkEntry::new("t2.example.org", key2.verifying_key()).to_string();
    let (nodes1, nodes2) = (test_nodes(5, 10), test_nodes(6, 20));
    let (tree1, _) = signed_tree(1, &nodes1, &[url2.clone()], &key1, "t1.example.org");
    let (tree2, _) = signed_tree(1, &nodes2, &[url1], &key2, "t2.example.org");

    let resolver = Arc::new(MapResolver::new());
    publish(&resolver, &tree1, "t1.example.org");
    publish(&resolver, &tree2, "t2.example.org");

    let trees = new_client(resolver).sync_linked(&url2).await?;
    assert_eq!(trees.len(), 2);
    assert_eq!(trees["t1.example.org"], tree1);
    assert_eq!(trees["t2.example.org"], tree2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn root_sequence_never_goes_back() -> anyhow::Result<()> {
    let key = test_key(14);
    let (old_nodes, new_nodes) = (test_nodes(7, 3), test_nodes(8, 5));
    let (tree1, url) = signed_tree(1, &old_nodes, &[], &key, "n");
    let (tree2, _) = signed_tree(2, &new_nodes, &[], &key, "n");

    let resolver = Arc::new(MapResolver::new());
    let client = new_client(resolver.clone());

    publish(&resolver, &tree1, "n");
    assert_eq!(ids(&client.sync_tree(&url).await?.nodes()), ids(&old_nodes));

    resolver.clear();
    publish(&resolver, &tree2, "n");
    assert_eq!(ids(&client.sync_tree(&url).await?.nodes()), ids(&new_nodes));

    // An older root published again does not replace what was already seen.
    resolver.clear();
    publish(&resolver, &tree1, "n");
    let synced = client.sync_tree(&url).await?;
    assert_eq!(synced.seq(), 2);
    assert_eq!(ids(&synced.nodes()), ids(&new_nodes));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn root_under_another_key_is_not_reused() -> anyhow::Result<()> {
    let (key_a, key_b) = (test_key(40), test_key(41));
    let (tree_a, url_a) = signed_tree(5, &test_nodes(11, 3), &[], &key_a, "n");
    let (tree_b, url_b) = signed_tree(1, &test_nodes(12, 4), &[], &key_b, "n");

    let resolver = Arc::new(MapResolver::new());
    let client = new_client(resolver.clone());
    publish(&resolver, &tree_a, "n");
    assert_eq!(client.sync_tree(&url_a).await?, tree_a);

    // The domain changes hands; its new root has a lower sequence number.
    resolver.clear();
    publish(&resolver, &tree_b, "n");
    let loc = LinkEntry::parse(&url_b)?;
    let root = client.resolve_root(&loc).await?;
    assert_eq!(root.seq, 1);
    assert!(root.verify_signature(&loc.public_key));
    assert_eq!(client.sync_tree(&url_b).await?, tree_b);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn clients_share_a_cache() -> anyhow::Result<()> {
    let (tree, url) = signed_tree(1, &test_nodes(9, 20), &[], &test_key(15), "n");
    let resolver = Arc::new(MapResolver::from(tree.to_txt("n")));
    let cache = Arc::new(ResolutionCache::new(100));

    let first = Client::new(Config::new(resolver.clone()).with_cache(cache.clone()));
    let second = Client::new(Config::new(resolver.clone()).with_cache(cache.clone()));
    first.sync_tree(&url).await?;
    let lookups = resolver.lookups();

    let synced = second.sync_tree(&url).await?;
    assert_eq!(synced, tree);
    // Only the root is looked up again.
    assert_eq!(resolver.lookups(), lookups + 1);
    assert_eq!(cache.len(), tree.len());
    Ok(())
}

struct StallingResolver;

#[async_trait]
impl Resolver for StallingResolver {
    async fn lookup_txt(&self, _name: &str) -> Result<Vec<String>, ResolveError> {
        std::future::pending().await
    }
}

#[test_log::test(tokio::test)]
async fn lookups_time_out() {
    let config = Config::new(Arc::new(StallingResolver)).timeout(Duration::from_millis(50));
    let url = LinkEntry::new("n", test_key(16).verifying_key()).to_string();

    let err = Client::new(config).sync_tree(&url).await.unwrap_err();
    assert_eq!(err, Error::name("n", ResolveError::Timeout));
}
