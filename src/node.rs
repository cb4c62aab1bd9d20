// src/node.rs
// In-memory node representations. LeafNode and IndexNode cache their
// encoded size and update it incrementally as pairs/entries are mutated,
// so BTree never has to re-walk a node just to check whether it still
// fits in one block.

use crate::codec;
use crate::key::{Key, NodeId};

#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode {
    id: NodeId,
    pairs: Vec<(Key, Vec<u8>)>,
    encoded_size: usize,
}

impl LeafNode {
    pub fn new(id: NodeId) -> Self {
        LeafNode {
            id,
            pairs: Vec::new(),
            encoded_size: codec::leaf_header_size(),
        }
    }

    /// Rehydrates a node whose encoded size is computed from its pairs
    /// (decode path and clone path both go through here).
    pub fn from_parts(id: NodeId, pairs: Vec<(Key, Vec<u8>)>) -> Self {
        let encoded_size = codec::leaf_encoded_size(
            pairs.first().map(|(k, _)| k.len()).unwrap_or(0),
            &pairs,
        );
        LeafNode {
            id,
            pairs,
            encoded_size,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn pairs(&self) -> &[(Key, Vec<u8>)] {
        &self.pairs
    }

    pub fn encoded_size(&self) -> usize {
        self.encoded_size
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn first_key(&self) -> Option<&Key> {
        self.pairs.first().map(|(k, _)| k)
    }

    fn search(&self, key: &Key) -> std::result::Result<usize, usize> {
        self.pairs.binary_search_by(|(k, _)| k.cmp(key))
    }

    pub fn get(&self, key: &Key) -> Option<&[u8]> {
        self.search(key).ok().map(|i| self.pairs[i].1.as_slice())
    }

    /// Inserts or replaces a pair, updating the cached size in place.
    pub fn insert(&mut self, key: Key, value: Vec<u8>, key_size: usize) {
        let pair_fixed = codec::leaf_pair_fixed_size(key_size);
        match self.search(&key) {
            Ok(i) => {
                self.encoded_size -= self.pairs[i].1.len();
                self.encoded_size += value.len();
                self.pairs[i].1 = value;
            }
            Err(i) => {
                self.encoded_size += pair_fixed + value.len();
                self.pairs.insert(i, (key, value));
            }
        }
    }

    /// Removes a pair if present, returning its value.
    pub fn remove(&mut self, key: &Key, key_size: usize) -> Option<Vec<u8>> {
        let i = self.search(key).ok()?;
        let (_, value) = self.pairs.remove(i);
        self.encoded_size -= codec::leaf_pair_fixed_size(key_size) + value.len();
        Some(value)
    }

    /// Pairs with key in `[lo, hi]` inclusive, in ascending order.
    pub fn find_pairs(&self, lo: &Key, hi: &Key) -> &[(Key, Vec<u8>)] {
        let start = self.pairs.partition_point(|(k, _)| k < lo);
        let end = self.pairs.partition_point(|(k, _)| k <= hi);
        &self.pairs[start..end.max(start)]
    }

    /// Splits off the tail starting at `mid`, returning it as a new node
    /// with the given id. `self` keeps `[0, mid)`.
    pub fn split_off(&mut self, mid: usize, right_id: NodeId, key_size: usize) -> LeafNode {
        let right_pairs = self.pairs.split_off(mid);
        self.encoded_size = codec::leaf_encoded_size(key_size, &self.pairs);
        let encoded_size = codec::leaf_encoded_size(key_size, &right_pairs);
        LeafNode {
            id: right_id,
            pairs: right_pairs,
            encoded_size,
        }
    }

    /// A clone with a fresh id, used by the CoW path.
    pub fn cloned_with_id(&self, new_id: NodeId) -> LeafNode {
        LeafNode {
            id: new_id,
            pairs: self.pairs.clone(),
            encoded_size: self.encoded_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexNode {
    id: NodeId,
    entries: Vec<(Key, NodeId)>,
    encoded_size: usize,
}

impl IndexNode {
    pub fn new(id: NodeId) -> Self {
        IndexNode {
            id,
            entries: Vec::new(),
            encoded_size: codec::index_header_size(),
        }
    }

    pub fn from_parts(id: NodeId, entries: Vec<(Key, NodeId)>) -> Self {
        let key_size = entries.first().map(|(k, _)| k.len()).unwrap_or(0);
        let encoded_size = codec::index_encoded_size(key_size, &entries);
        IndexNode {
            id,
            entries,
            encoded_size,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn entries(&self) -> &[(Key, NodeId)] {
        &self.entries
    }

    pub fn encoded_size(&self) -> usize {
        self.encoded_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_key(&self) -> Option<&Key> {
        self.entries.first().map(|(k, _)| k)
    }

    /// Index into `entries` of the child subtree that must contain `key`:
    /// the entry with the greatest key <= `key`, or entry 0 if `key` is
    /// smaller than every entry's key (leftmost-key pinning, spec 4.2).
    pub fn child_index(&self, key: &Key) -> usize {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    pub fn child_at(&self, i: usize) -> NodeId {
        self.entries[i].1
    }

    /// Entry range whose subtrees might intersect `[lo, hi]`: every entry
    /// whose key is <= hi, starting from the entry selected for `lo`.
    pub fn child_range(&self, lo: &Key, hi: &Key) -> std::ops::Range<usize> {
        let start = self.child_index(lo);
        let end = self.entries.partition_point(|(k, _)| k <= hi).max(start + 1);
        start..end.min(self.entries.len())
    }

    pub fn insert(&mut self, key: Key, child: NodeId, key_size: usize) {
        let entry_size = codec::index_entry_size(key_size);
        match self.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(i) => {
                self.entries[i].1 = child;
            }
            Err(i) => {
                self.entries.insert(i, (key, child));
                self.encoded_size += entry_size;
            }
        }
    }

    /// Replaces the key of the entry pointing at `child_index` without
    /// changing cardinality (leftmost-key maintenance after a split or a
    /// leaf-emptying remove).
    pub fn set_key_at(&mut self, i: usize, key: Key) {
        self.entries[i].0 = key;
    }

    /// Retargets entry `i` to a different child id without touching its
    /// key (the CoW descent path: the key is unchanged, only the pointer
    /// moves to a freshly cloned node).
    pub fn set_child_at(&mut self, i: usize, child: NodeId) {
        self.entries[i].1 = child;
    }

    pub fn remove_at(&mut self, i: usize, key_size: usize) -> (Key, NodeId) {
        let entry = self.entries.remove(i);
        self.encoded_size -= codec::index_entry_size(key_size);
        entry
    }

    /// Overwrites both the key and child pointer of entry `i` in place
    /// (leftmost-key maintenance plus a CoW'd child id, in one step).
    pub fn set_entry_at(&mut self, i: usize, key: Key, child: NodeId) {
        self.entries[i] = (key, child);
    }

    /// Appends `entries` to the tail (used by sibling merge/redistribute).
    pub fn append_from(&mut self, mut entries: Vec<(Key, NodeId)>, key_size: usize) {
        self.encoded_size += entries.len() * codec::index_entry_size(key_size);
        self.entries.append(&mut entries);
    }

    /// Prepends `entries` to the head (used by sibling redistribute).
    pub fn prepend_from(&mut self, mut entries: Vec<(Key, NodeId)>, key_size: usize) {
        self.encoded_size += entries.len() * codec::index_entry_size(key_size);
        entries.append(&mut self.entries);
        self.entries = entries;
    }

    /// Removes and returns the first `n` entries.
    pub fn drain_front(&mut self, n: usize, key_size: usize) -> Vec<(Key, NodeId)> {
        let drained: Vec<_> = self.entries.drain(0..n).collect();
        self.encoded_size -= n * codec::index_entry_size(key_size);
        drained
    }

    /// Removes and returns the last `n` entries.
    pub fn drain_back(&mut self, n: usize, key_size: usize) -> Vec<(Key, NodeId)> {
        let split_at = self.entries.len() - n;
        let drained: Vec<_> = self.entries.drain(split_at..).collect();
        self.encoded_size -= n * codec::index_entry_size(key_size);
        drained
    }

    pub fn split_off(&mut self, mid: usize, right_id: NodeId, key_size: usize) -> IndexNode {
        let right_entries = self.entries.split_off(mid);
        self.encoded_size = codec::index_encoded_size(key_size, &self.entries);
        let encoded_size = codec::index_encoded_size(key_size, &right_entries);
        IndexNode {
            id: right_id,
            entries: right_entries,
            encoded_size,
        }
    }

    pub fn cloned_with_id(&self, new_id: NodeId) -> IndexNode {
        IndexNode {
            id: new_id,
            entries: self.entries.clone(),
            encoded_size: self.encoded_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Index(IndexNode),
}

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Node::Leaf(l) => l.id(),
            Node::Index(i) => i.id(),
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            Node::Leaf(l) => l.encoded_size(),
            Node::Index(i) => i.encoded_size(),
        }
    }

    pub fn first_key(&self) -> Option<&Key> {
        match self {
            Node::Leaf(l) => l.first_key(),
            Node::Index(i) => i.first_key(),
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Node::Leaf(l) => Some(l),
            Node::Index(_) => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match self {
            Node::Leaf(l) => Some(l),
            Node::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<&IndexNode> {
        match self {
            Node::Index(i) => Some(i),
            Node::Leaf(_) => None,
        }
    }

    pub fn as_index_mut(&mut self) -> Option<&mut IndexNode> {
        match self {
            Node::Index(i) => Some(i),
            Node::Leaf(_) => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> Key {
        Key::from_raw(vec![n; 4])
    }

    #[test]
    fn leaf_insert_replace_updates_size() {
        let mut leaf = LeafNode::new(NodeId(1));
        leaf.insert(key(2), vec![1, 2, 3], 4);
        let size_after_insert = leaf.encoded_size();
        leaf.insert(key(2), vec![9, 9], 4);
        assert_eq!(leaf.len(), 1);
        assert_eq!(leaf.encoded_size(), size_after_insert - 1);
    }

    #[test]
    fn leaf_find_pairs_is_inclusive() {
        let mut leaf = LeafNode::new(NodeId(1));
        for i in 0..10u8 {
            leaf.insert(key(i), vec![i], 4);
        }
        let found = leaf.find_pairs(&key(3), &key(6));
        assert_eq!(found.len(), 4);
        assert_eq!(found[0].0, key(3));
        assert_eq!(found[3].0, key(6));
    }

    #[test]
    fn index_child_index_descends_left_of_first_key() {
        let mut idx = IndexNode::new(NodeId(1));
        idx.insert(key(5), NodeId(10), 4);
        idx.insert(key(10), NodeId(11), 4);
        assert_eq!(idx.child_index(&key(0)), 0);
        assert_eq!(idx.child_index(&key(5)), 0);
        assert_eq!(idx.child_index(&key(7)), 0);
        assert_eq!(idx.child_index(&key(10)), 1);
        assert_eq!(idx.child_index(&key(255)), 1);
    }

    #[test]
    fn leaf_split_off_preserves_total_pairs() {
        let mut leaf = LeafNode::new(NodeId(1));
        for i in 0..10u8 {
            leaf.insert(key(i), vec![i], 4);
        }
        let right = leaf.split_off(5, NodeId(2), 4);
        assert_eq!(leaf.len(), 5);
        assert_eq!(right.len(), 5);
        assert_eq!(right.first_key(), Some(&key(5)));
    }
}
