//! Scenario tests for the map surface: ordering, splits, append mode,
//! snapshots, rollback, and the persistent-mode behaviors.

mod common;

use std::cmp::Ordering;
use std::sync::Arc;

use mvtree::decision::is_leaf_position;
use mvtree::page::Page;
use mvtree::types::{DecimalStr, StringSize};
use mvtree::{MapBuilder, MvError, MvStore};

/// Recursively validate structural invariants below `page`, returning the
/// subtree entry count.
fn check_page<K: Clone, V: Clone>(
    page: &Page<K, V>,
    keys_per_page: usize,
    compare: &dyn Fn(&K, &K) -> Ordering,
) -> u64 {
    for i in 1..page.key_count() {
        assert_eq!(
            compare(page.get_key(i - 1), page.get_key(i)),
            Ordering::Less,
            "keys out of order"
        );
    }
    assert!(page.key_count() <= keys_per_page, "page overfull");
    if page.is_leaf() {
        return page.key_count() as u64;
    }
    assert_eq!(page.child_count(), page.key_count() + 1);
    let mut total = 0;
    for i in 0..page.child_count() {
        let child_total = check_page(page.child_page(i), keys_per_page, compare);
        assert_eq!(child_total, page.counts(i), "stale cached subtree count");
        total += child_total;
    }
    assert_eq!(total, page.total_count(), "stale total count");
    total
}

fn decimal_builder() -> MapBuilder<String, String> {
    MapBuilder::with_types(Arc::new(DecimalStr), Arc::new(StringSize))
}

#[test]
fn numeric_keys_survive_commit_and_reopen() {
    common::init_tracing();
    let store = MvStore::builder().page_store().open();
    {
        let map = store.open_map("numbers", decimal_builder()).unwrap();
        for i in 0..400 {
            map.put(i.to_string(), i.to_string()).unwrap();
        }
        store.commit();
    }
    // dropping the handle loses nothing: the map reopens from its stored root
    let map = store.open_map("numbers", decimal_builder()).unwrap();
    assert_eq!(map.size_as_long(), 400);
    assert_eq!(map.get(&"399".to_string()), Some("399".to_string()));
    assert_eq!(map.first_key(), Some("0".to_string()));
    assert_eq!(map.last_key(), Some("399".to_string()));
    let keys: Vec<String> = map.keys_from(None).collect();
    let expected: Vec<String> = (0..400).map(|i| i.to_string()).collect();
    assert_eq!(keys, expected);
}

#[test]
fn insert_past_page_cap_splits_the_root() {
    let store = MvStore::builder().keys_per_page(4).open();
    let map = store
        .open_map::<String, String>("letters", MapBuilder::new())
        .unwrap();
    for key in ["A", "B", "C", "D", "E"] {
        map.put(key.to_string(), key.to_lowercase()).unwrap();
    }
    let root = map.root_page();
    assert!(!root.is_leaf(), "five entries must not fit one page of four");
    assert!(root.child_count() >= 2);
    check_page(&root, 4, &|a: &String, b: &String| a.cmp(b));
    for key in ["A", "B", "C", "D", "E"] {
        assert_eq!(map.get(&key.to_string()), Some(key.to_lowercase()));
    }
    let keys: Vec<String> = map.keys_from(None).collect();
    assert_eq!(keys, vec!["A", "B", "C", "D", "E"]);
}

#[test]
fn single_writer_append_and_trim() {
    let store = MvStore::builder().open();
    let map = store
        .open_map("log", MapBuilder::<String, String>::new().single_writer())
        .unwrap();
    for i in 1..=99 {
        map.append(format!("k{i:02}"), format!("v{i}")).unwrap();
    }
    assert_eq!(map.size_as_long(), 99);
    assert_eq!(map.get(&"k50".to_string()), Some("v50".to_string()));
    assert_eq!(map.last_key(), Some("k99".to_string()));
    for _ in 0..10 {
        map.trim_last().unwrap();
    }
    assert_eq!(map.size_as_long(), 89);
    assert_eq!(map.last_key(), Some("k89".to_string()));
    check_page(&map.root_page(), 48, &|a: &String, b: &String| a.cmp(b));
}

#[test]
fn append_equals_put_for_ascending_keys() {
    let store = MvStore::builder().keys_per_page(8).open();
    let appended = store
        .open_map("appended", MapBuilder::<String, u32>::new().single_writer())
        .unwrap();
    let put = store
        .open_map("put", MapBuilder::<String, u32>::new())
        .unwrap();
    for i in 0..100u32 {
        appended.append(format!("{i:03}"), i).unwrap();
        put.put(format!("{i:03}"), i).unwrap();
    }
    let a: Vec<(String, u32)> = appended.iter().collect();
    let b: Vec<(String, u32)> = put.iter().collect();
    assert_eq!(a, b);
    check_page(&appended.root_page(), 8, &|a: &String, b: &String| a.cmp(b));
}

#[test]
fn append_on_multi_writer_map_falls_back_to_put() {
    let store = MvStore::builder().open();
    let map = store
        .open_map::<String, String>("plain", MapBuilder::new())
        .unwrap();
    map.append("a".into(), "1".into()).unwrap();
    assert_eq!(map.get(&"a".to_string()), Some("1".to_string()));
    map.trim_last().unwrap();
    assert!(map.is_empty());
}

#[test]
fn snapshot_is_stable_under_writes() {
    let store = MvStore::builder().open();
    let map = store
        .open_map::<String, String>("snap", MapBuilder::new())
        .unwrap();
    for i in 0..100 {
        map.put(format!("{i:03}"), "original".to_string()).unwrap();
    }
    let version = store.current_version();
    let snapshot = map.open_version(version).unwrap();
    assert!(snapshot.is_read_only());
    for i in 0..100 {
        map.put(format!("{i:03}"), "changed".to_string()).unwrap();
    }
    for i in 0..100 {
        assert_eq!(
            snapshot.get(&format!("{i:03}")),
            Some("original".to_string()),
            "snapshot leaked a later write"
        );
        assert_eq!(map.get(&format!("{i:03}")), Some("changed".to_string()));
    }
    assert_eq!(snapshot.size_as_long(), 100);
}

#[test]
fn snapshot_rejects_writes_and_reopening() {
    let store = MvStore::builder().open();
    let map = store
        .open_map::<String, String>("ro", MapBuilder::new())
        .unwrap();
    map.put("a".into(), "1".into()).unwrap();
    let snapshot = map.open_version(store.current_version()).unwrap();
    assert!(matches!(
        snapshot.put("b".into(), "2".into()),
        Err(MvError::ReadOnly { .. })
    ));
    assert!(matches!(
        snapshot.open_version(0),
        Err(MvError::ReadOnly { .. })
    ));
}

#[test]
fn open_version_rejects_unknown_versions() {
    let store = MvStore::builder().open();
    store.commit();
    store.commit();
    let map = store
        .open_map::<String, String>("late", MapBuilder::new())
        .unwrap();
    assert_eq!(map.create_version(), 2);
    assert!(matches!(
        map.open_version(1),
        Err(MvError::UnknownVersion { version: 1 })
    ));
}

#[test]
fn rollback_restores_the_previous_commit() {
    let store = MvStore::builder().open();
    let map = store
        .open_map::<String, String>("roll", MapBuilder::new())
        .unwrap();
    map.put("a".into(), "1".into()).unwrap();
    store.commit();
    let version = store.current_version();
    map.put("a".into(), "2".into()).unwrap();
    assert_eq!(map.get(&"a".to_string()), Some("2".to_string()));
    store.rollback_to(version).unwrap();
    assert_eq!(map.get(&"a".to_string()), Some("1".to_string()));
    // rolling back to the same version again changes nothing
    store.rollback_to(version).unwrap();
    assert_eq!(map.get(&"a".to_string()), Some("1".to_string()));
    assert_eq!(store.current_version(), version);
}

#[test]
fn conditional_updates() {
    let store = MvStore::builder().open();
    let map = store
        .open_map::<String, String>("cond", MapBuilder::new())
        .unwrap();
    assert_eq!(map.put_if_absent("k".into(), "1".into()).unwrap(), None);
    assert_eq!(
        map.put_if_absent("k".into(), "2".into()).unwrap(),
        Some("1".to_string())
    );
    assert_eq!(map.get(&"k".to_string()), Some("1".to_string()));

    assert!(map
        .replace_if_equals(&"k".to_string(), &"1".to_string(), "2".into())
        .unwrap());
    assert!(!map
        .replace_if_equals(&"k".to_string(), &"1".to_string(), "3".into())
        .unwrap());
    assert_eq!(map.get(&"k".to_string()), Some("2".to_string()));

    assert_eq!(
        map.replace(&"k".to_string(), "4".into()).unwrap(),
        Some("2".to_string())
    );
    assert_eq!(map.replace(&"missing".to_string(), "x".into()).unwrap(), None);
    assert!(!map.contains_key(&"missing".to_string()));

    assert!(!map
        .remove_if_equals(&"k".to_string(), &"nope".to_string())
        .unwrap());
    assert!(map
        .remove_if_equals(&"k".to_string(), &"4".to_string())
        .unwrap());
    assert!(map.is_empty());
}

#[test]
fn ranked_access_round_trips() {
    let store = MvStore::builder().keys_per_page(4).open();
    let map = store
        .open_map::<String, u32>("rank", MapBuilder::new())
        .unwrap();
    for i in 0..50u32 {
        map.put(format!("{:03}", i * 2), i).unwrap();
    }
    for rank in 0..50i64 {
        let key = map.get_key(rank).unwrap();
        assert_eq!(map.get_key_index(&key), rank);
    }
    assert_eq!(map.get_key(-1), None);
    assert_eq!(map.get_key(50), None);
    // missing keys report their insertion rank, negative-encoded
    assert_eq!(map.get_key_index(&"001".to_string()), -2);
    assert_eq!(map.get_key_index(&"zzz".to_string()), -51);

    let list = map.key_list();
    assert_eq!(list.len(), 50);
    assert_eq!(list.get(10), Some("020".to_string()));
    assert_eq!(list.index_of(&"020".to_string()), 10);
}

#[test]
fn neighbor_lookups() {
    let store = MvStore::builder().keys_per_page(4).open();
    let map = store
        .open_map::<String, u32>("nav", MapBuilder::new())
        .unwrap();
    for i in (0..100u32).step_by(10) {
        map.put(format!("{i:03}"), i).unwrap();
    }
    let key = |i: u32| format!("{i:03}");
    assert_eq!(map.higher_key(&key(20)), Some(key(30)));
    assert_eq!(map.higher_key(&key(25)), Some(key(30)));
    assert_eq!(map.higher_key(&key(90)), None);
    assert_eq!(map.ceiling_key(&key(20)), Some(key(20)));
    assert_eq!(map.ceiling_key(&key(25)), Some(key(30)));
    assert_eq!(map.floor_key(&key(25)), Some(key(20)));
    assert_eq!(map.floor_key(&key(20)), Some(key(20)));
    assert_eq!(map.lower_key(&key(20)), Some(key(10)));
    assert_eq!(map.lower_key(&key(0)), None);
}

#[test]
fn range_cursors() {
    let store = MvStore::builder().keys_per_page(4).open();
    let map = store
        .open_map::<String, u32>("scan", MapBuilder::new())
        .unwrap();
    for i in 0..20u32 {
        map.put(format!("{i:02}"), i).unwrap();
    }
    let forward: Vec<u32> = map
        .cursor_range(Some(&"05".to_string()), Some(&"10".to_string()), false)
        .map(|(_, v)| v)
        .collect();
    assert_eq!(forward, vec![5, 6, 7, 8, 9, 10]);
    let reverse: Vec<u32> = map
        .cursor_range(Some(&"10".to_string()), Some(&"05".to_string()), true)
        .map(|(_, v)| v)
        .collect();
    assert_eq!(reverse, vec![10, 9, 8, 7, 6, 5]);
    let reversed_keys: Vec<String> = map.keys_reverse(None).collect();
    let mut expected: Vec<String> = (0..20u32).map(|i| format!("{i:02}")).collect();
    expected.reverse();
    assert_eq!(reversed_keys, expected);
}

#[test]
fn clear_and_reuse() {
    let store = MvStore::builder().keys_per_page(4).open();
    let map = store
        .open_map::<String, u32>("clear", MapBuilder::new())
        .unwrap();
    for i in 0..100u32 {
        map.put(format!("{i:03}"), i).unwrap();
    }
    map.clear().unwrap();
    assert!(map.is_empty());
    assert_eq!(map.first_key(), None);
    assert_eq!(map.iter().count(), 0);
    map.put("back".into(), 1).unwrap();
    assert_eq!(map.size(), 1);
}

#[test]
fn removal_collapses_intermediate_nodes() {
    let store = MvStore::builder().keys_per_page(4).open();
    let map = store
        .open_map::<String, u32>("shrink", MapBuilder::new())
        .unwrap();
    for i in 0..64u32 {
        map.put(format!("{i:03}"), i).unwrap();
    }
    assert!(!map.root_page().is_leaf());
    for i in 0..64u32 {
        map.remove(&format!("{i:03}")).unwrap();
        check_page(&map.root_page(), 4, &|a: &String, b: &String| a.cmp(b));
    }
    assert!(map.is_empty());
    assert!(map.root_page().is_leaf());
    // removing from an empty map is a no-op
    assert_eq!(map.remove(&"000".to_string()).unwrap(), None);
}

#[test]
fn copy_from_replicates_content() {
    let store = MvStore::builder().keys_per_page(4).open();
    let source = store
        .open_map::<String, u32>("source", MapBuilder::new())
        .unwrap();
    for i in 0..50u32 {
        source.put(format!("{i:03}"), i).unwrap();
    }
    let target = store
        .open_map::<String, u32>("target", MapBuilder::new())
        .unwrap();
    target.put("stale".into(), 0).unwrap();
    target.copy_from(&source).unwrap();
    let a: Vec<(String, u32)> = source.iter().collect();
    let b: Vec<(String, u32)> = target.iter().collect();
    assert_eq!(a, b);
    check_page(&target.root_page(), 4, &|a: &String, b: &String| a.cmp(b));
}

#[test]
fn rewrite_page_forces_fresh_copies() {
    let store = MvStore::builder().keys_per_page(4).page_store().open();
    let map = store
        .open_map::<String, u32>("compact", MapBuilder::new())
        .unwrap();
    for i in 0..40u32 {
        map.put(format!("{i:03}"), i).unwrap();
    }
    store.commit();
    let root = map.root_page();
    assert!(root.is_saved());
    let node_pos = root.pos();
    assert!(!is_leaf_position(node_pos));
    let mut leaf = Arc::clone(&root);
    while !leaf.is_leaf() {
        let child = Arc::clone(leaf.child_page(0));
        leaf = child;
    }
    let leaf_pos = leaf.pos();
    assert!(is_leaf_position(leaf_pos));

    assert!(map.rewrite_page(leaf_pos).unwrap());
    // the rewritten path is unsaved again
    assert!(!map.root_page().is_saved());
    // the page is gone from the live tree now, so a second rewrite aborts
    assert!(!map.rewrite_page(leaf_pos).unwrap());
    // rewriting by the old internal position walks the tip's parents
    assert!(!map.rewrite_page(node_pos).unwrap());
    store.commit();
    let fresh_node_pos = map.root_page().pos();
    assert!(map.rewrite_page(fresh_node_pos).unwrap());
}

#[test]
fn has_changes_since_tracks_versions() {
    let store = MvStore::builder().open();
    let map = store
        .open_map::<String, u32>("dirty", MapBuilder::new())
        .unwrap();
    assert!(!map.has_changes_since(0));
    map.put("a".into(), 1).unwrap();
    store.commit();
    assert!(!map.has_changes_since(1));
    map.put("a".into(), 2).unwrap();
    assert!(map.has_changes_since(0));
    assert!(!map.has_changes_since(1));
    store.commit();
    map.put("a".into(), 3).unwrap();
    assert!(map.has_changes_since(1));
}

#[test]
fn volatile_maps_are_not_saved() {
    let store = MvStore::builder().page_store().open();
    let map = store
        .open_map::<String, u32>("scratch", MapBuilder::new())
        .unwrap();
    map.set_volatile(true);
    assert!(map.is_volatile());
    map.put("a".into(), 1).unwrap();
    store.commit();
    assert!(!map.root_page().is_saved());
    {
        let keep = store
            .open_map::<String, u32>("keep", MapBuilder::new())
            .unwrap();
        keep.put("b".into(), 2).unwrap();
        store.commit();
        assert!(keep.root_page().is_saved());
    }
}

#[test]
fn decimal_order_differs_from_byte_order() {
    let store = MvStore::builder().open();
    let map = store.open_map("decimal", decimal_builder()).unwrap();
    for key in ["9", "10", "100", "2"] {
        map.put(key.to_string(), key.to_string()).unwrap();
    }
    let keys: Vec<String> = map.keys_from(None).collect();
    assert_eq!(keys, vec!["2", "9", "10", "100"]);
    assert_eq!(map.first_key(), Some("2".to_string()));
    assert_eq!(map.last_key(), Some("100".to_string()));
}

#[test]
fn operate_with_custom_decision_maker() {
    use mvtree::decision::{Decision, DecisionMaker};

    /// Keeps the larger of the stored and offered values.
    struct KeepMax;

    impl DecisionMaker<String, u32> for KeepMax {
        fn decide(&mut self, _existing: Option<&u32>, _provided: Option<&u32>) -> Decision {
            Decision::Put
        }

        fn select_value(&mut self, existing: Option<&u32>, provided: Option<u32>) -> Option<u32> {
            match (existing, provided) {
                (Some(&old), Some(new)) => Some(old.max(new)),
                (_, new) => new,
            }
        }
    }

    let store = MvStore::builder().open();
    let map = store
        .open_map::<String, u32>("max", MapBuilder::new())
        .unwrap();
    map.operate("k".into(), Some(10), &mut KeepMax).unwrap();
    map.operate("k".into(), Some(3), &mut KeepMax).unwrap();
    assert_eq!(map.get(&"k".to_string()), Some(10));
    map.operate("k".into(), Some(42), &mut KeepMax).unwrap();
    assert_eq!(map.get(&"k".to_string()), Some(42));
}
