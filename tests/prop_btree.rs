use std::collections::BTreeMap;
use std::sync::Arc;

use lodestone::{BPlusTree, MemoryPageStore};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, u32),
    Delete(u16),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (any::<u16>(), any::<u32>()).prop_map(|(k, v)| Op::Insert(k % 512, v)),
        1 => any::<u16>().prop_map(|k| Op::Delete(k % 512)),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_tree_matches_btreemap(ops in proptest::collection::vec(op(), 1..400)) {
        let rt = runtime();
        let (model, entries, deleted_ok) = rt.block_on(async {
            let store = Arc::new(MemoryPageStore::new(512).unwrap());
            let mut tree: BPlusTree<_, u16, u32> = BPlusTree::open(store).await.unwrap();
            let mut model = BTreeMap::new();
            let mut deleted_ok = true;
            for op in &ops {
                match *op {
                    Op::Insert(k, v) => {
                        tree.insert(k, v).await.unwrap();
                        model.insert(k, v);
                    }
                    Op::Delete(k) => {
                        deleted_ok &= tree.delete(&k).await.unwrap() == model.remove(&k).is_some();
                    }
                }
            }
            let entries = tree.in_order().collect_all().await.unwrap();
            (model, entries, deleted_ok)
        });
        prop_assert!(deleted_ok);
        prop_assert_eq!(entries, model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn prop_scan_is_the_model_range(keys in proptest::collection::btree_set(any::<u32>(), 0..300), a in any::<u32>(), b in any::<u32>()) {
        let (lo, hi) = (a.min(b), a.max(b));
        let rt = runtime();
        let scanned = rt.block_on(async {
            let store = Arc::new(MemoryPageStore::new(512).unwrap());
            let mut tree: BPlusTree<_, u32, u32> = BPlusTree::open(store).await.unwrap();
            for &k in &keys {
                tree.insert(k, !k).await.unwrap();
            }
            tree.scan(lo, hi).collect_all().await.unwrap()
        });
        let expected: Vec<(u32, u32)> = keys.range(lo..=hi).map(|&k| (k, !k)).collect();
        prop_assert_eq!(scanned, expected);
    }
}
