use kvset_tree::{
    Config, InternalValue, MemAllocator, MemHealth, MemJournal, RuntimeParams, SeqNo, Tree,
    TreeParams, ValueType,
};
use std::sync::Arc;

pub struct Fixture {
    pub tree: Tree,
    pub journal: Arc<MemJournal>,
    pub allocator: Arc<MemAllocator>,
    pub health: Arc<MemHealth>,
}

pub fn fixture(params: TreeParams) -> Fixture {
    fixture_with(params, RuntimeParams::default())
}

pub fn fixture_with(params: TreeParams, rparams: RuntimeParams) -> Fixture {
    let journal = Arc::new(MemJournal::new());
    let allocator = Arc::new(MemAllocator::default());
    let health = Arc::new(MemHealth::default());

    let tree = Config::new(params)
        .runtime_params(rparams)
        .journal(journal.clone())
        .allocator(allocator.clone())
        .health(health.clone())
        .open()
        .expect("tree opens");

    Fixture {
        tree,
        journal,
        allocator,
        health,
    }
}

/// Ingests one kvset holding the given live values.
pub fn ingest_values(tree: &Tree, items: &[(&str, &str, SeqNo)]) {
    let entries = items
        .iter()
        .map(|(key, value, seqno)| {
            InternalValue::from_components(*key, *value, *seqno, ValueType::Value)
        })
        .collect();
    ingest_entries(tree, entries);
}

/// Ingests one kvset holding the given entries (any order).
pub fn ingest_entries(tree: &Tree, mut entries: Vec<InternalValue>) {
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    let mut builder = tree.kvset_builder();
    for entry in entries {
        builder.add(entry).expect("builder accepts entry");
    }

    let built = builder
        .finish()
        .expect("build succeeds")
        .expect("kvset is not empty");

    tree.ingest(built, None).expect("ingest succeeds");
}

/// Asserts that the tree-wide samp record equals the sum of the
/// per-node records.
pub fn assert_samp_consistent(tree: &Tree) {
    let mut sum = kvset_tree::SampStats::default();

    for node_id in tree.node_ids() {
        let node_samp = tree.node_samp(node_id).expect("node exists");
        sum.r_alen += node_samp.r_alen;
        sum.r_wlen += node_samp.r_wlen;
        sum.i_alen += node_samp.i_alen;
        sum.l_alen += node_samp.l_alen;
        sum.l_good += node_samp.l_good;
    }

    assert_eq!(sum, tree.samp());
}
