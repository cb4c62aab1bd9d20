// Property-based tests for the algebraic laws spec §8 names: insert then
// lookup round-trips, a later insert overwrites, remove then lookup fails,
// and a cloned tree is isolated from later mutation of its source.

use larch::{Forest, ForestConfig};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

proptest! {
    #[test]
    fn prop_insert_then_lookup_matches_a_reference_map(
        pairs in prop::collection::vec((any::<u32>(), prop::collection::vec(any::<u8>(), 0..20)), 1..200)
    ) {
        let mut forest = Forest::new_in_memory(ForestConfig::new(4, 128));
        let t = forest.new_tree();
        let mut reference = BTreeMap::new();

        for (k, v) in &pairs {
            forest.insert(t, key(*k), v.clone()).unwrap();
            reference.insert(*k, v.clone());
        }

        for (k, v) in &reference {
            assert_eq!(forest.lookup(t, &key(*k)).unwrap(), *v);
        }
        prop_assert_eq!(
            forest.count_range(t, &key(0), &key(u32::MAX)).unwrap() as usize,
            reference.len()
        );
    }
}

proptest! {
    #[test]
    fn prop_remove_then_lookup_always_fails(keys in prop::collection::hash_set(any::<u32>(), 1..100)) {
        let mut forest = Forest::new_in_memory(ForestConfig::new(4, 128));
        let t = forest.new_tree();
        for k in &keys {
            forest.insert(t, key(*k), key(*k)).unwrap();
        }
        for k in &keys {
            forest.remove(t, &key(*k)).unwrap();
            prop_assert!(forest.lookup(t, &key(*k)).is_err());
            prop_assert!(forest.remove(t, &key(*k)).is_err());
        }
    }
}

proptest! {
    #[test]
    fn prop_clone_is_isolated_from_source_mutation(
        keys in prop::collection::hash_set(any::<u32>(), 1..150),
        removed in prop::collection::hash_set(any::<u32>(), 0..150),
    ) {
        let mut forest = Forest::new_in_memory(ForestConfig::new(4, 128));
        let source = forest.new_tree();
        for k in &keys {
            forest.insert(source, key(*k), key(*k)).unwrap();
        }

        let clone = forest.new_tree_from(source).unwrap();
        for k in &removed {
            let _ = forest.remove(clone, &key(*k));
        }

        // Whatever happened to the clone, the source must still have
        // every key it had before the clone was taken.
        for k in &keys {
            prop_assert_eq!(forest.lookup(source, &key(*k)).unwrap(), key(*k));
        }
    }
}
