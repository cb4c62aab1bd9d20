// src/forest.rs
// A Forest owns exactly one NodeStore and a set of trees that share it.
// Trees are cheap to clone (`new_tree_from`) because cloning only ever
// touches the root and its direct children; everything below is shared
// until a write forces a copy-on-write split somewhere in the middle.
//
// `commit()` is the only thing that makes a forest's mutations durable:
// inserts/removes/clones before a commit are visible in-process but are
// rolled back by `Journal::recover` if the process dies first. A forest
// that hits `JournalReplayFailed`, `NodeMissing` or `CorruptNode` while
// committing is poisoned — every subsequent call returns `Poisoned`
// until the caller drops it and reopens the directory fresh.

use ahash::{AHashMap, AHashSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::btree::{compute_index_bounds, max_value_size, BTree};
use crate::config::ForestConfig;
use crate::error::{LarchError, Result};
use crate::journal::Journal;
use crate::key::NodeId;
use crate::node::Node;
use crate::store::{DiskNodeStore, MemNodeStore, NodeStore};

const METADATA_FILE: &str = "forest.meta";

/// Handle to one tree inside a [`Forest`]. Only ever constructed by the
/// forest that owns the tree; using one against a different forest, or
/// after `remove_tree`, is a programmer error (not a recoverable one —
/// there is no "tree not found" entry in [`LarchError`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeId(usize);

/// A consistency violation surfaced by [`Forest::walk`]. Read-only and
/// non-exhaustive on purpose: a node reachable through more than one
/// parent is visited (and can be reported) once per path, since dedup
/// would cost more than this diagnostic primitive is worth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    OversizedNode { id: NodeId, size: usize, limit: usize },
    IndexUnderfilled { id: NodeId, len: usize, min: usize },
    IndexOverfilled { id: NodeId, len: usize, max: usize },
    LeftmostKeyMismatch { parent: NodeId, child: NodeId },
    DanglingReference { parent: NodeId, child: NodeId },
    RefcountMismatch { id: NodeId, observed: u32, stored: u16 },
    LeakedNode { id: NodeId, stored: u16 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::OversizedNode { id, size, limit } => {
                write!(f, "node {id} encodes to {size} bytes, over limit {limit}")
            }
            Violation::IndexUnderfilled { id, len, min } => {
                write!(f, "index node {id} has {len} entries, below minimum {min}")
            }
            Violation::IndexOverfilled { id, len, max } => {
                write!(f, "index node {id} has {len} entries, above maximum {max}")
            }
            Violation::LeftmostKeyMismatch { parent, child } => {
                write!(f, "index node {parent} entry for child {child} has the wrong key")
            }
            Violation::DanglingReference { parent, child } => {
                write!(f, "node {parent} references missing child {child}")
            }
            Violation::RefcountMismatch { id, observed, stored } => {
                write!(f, "node {id}: observed {observed} parent pointers, stored refcount is {stored}")
            }
            Violation::LeakedNode { id, stored } => {
                write!(f, "node {id} has refcount {stored} but is unreachable from any tree")
            }
        }
    }
}

/// Format/codec version written to every committed metadata file (spec §6).
const FORMAT_VERSION: &str = "1/1";

/// `root_ids` is the list of *currently existing* tree roots (spec §3,
/// §6) — a removed tree leaves no trace, it is not a hole in the list.
/// `NodeId::NONE` (`0`) marks an existing-but-empty tree, distinct from
/// "no tree here". Removed slots in the in-process `Vec<Option<BTree>>`
/// are simply skipped, so a reopened forest's trees are dense and
/// renumbered from 0 — a `TreeId` never survives a reopen anyway (it is
/// only ever valid against the `Forest` instance that issued it).
fn encode_metadata(key_size: usize, node_size: usize, last_id: u64, trees: &[Option<BTree>]) -> Vec<u8> {
    let mut buf = String::new();
    buf.push_str(&format!("format {FORMAT_VERSION}\n"));
    buf.push_str(&format!("node_size {node_size}\n"));
    buf.push_str(&format!("key_size {key_size}\n"));
    buf.push_str(&format!("last_id {last_id}\n"));
    let root_ids = trees
        .iter()
        .flatten()
        .map(|t| t.root().0.to_string())
        .collect::<Vec<_>>()
        .join(",");
    buf.push_str(&format!("root_ids {root_ids}\n"));
    buf.into_bytes()
}

fn decode_metadata(bytes: &[u8]) -> Result<(usize, usize, u64, Vec<NodeId>)> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| LarchError::FormatProblem(format!("metadata not utf8: {e}")))?;

    let mut format = None;
    let mut key_size = None;
    let mut node_size = None;
    let mut last_id = None;
    let mut root_ids = None;

    for line in text.lines() {
        let Some((tag, rest)) = line.split_once(' ') else {
            continue;
        };
        match tag {
            "format" => format = Some(rest.to_string()),
            "key_size" => key_size = rest.parse().ok(),
            "node_size" => node_size = rest.parse().ok(),
            "last_id" => last_id = rest.parse().ok(),
            "root_ids" => root_ids = Some(rest.to_string()),
            _ => {}
        }
    }

    let format = format.ok_or_else(|| LarchError::FormatProblem("metadata missing format".into()))?;
    if format != FORMAT_VERSION {
        return Err(LarchError::FormatProblem(format!(
            "unknown format {format}, expected {FORMAT_VERSION}"
        )));
    }
    let key_size = key_size.ok_or_else(|| LarchError::FormatProblem("metadata missing key_size".into()))?;
    let node_size = node_size.ok_or_else(|| LarchError::FormatProblem("metadata missing node_size".into()))?;
    let last_id = last_id.ok_or_else(|| LarchError::FormatProblem("metadata missing last_id".into()))?;
    let root_ids = root_ids.ok_or_else(|| LarchError::FormatProblem("metadata missing root_ids".into()))?;

    let trees = if root_ids.is_empty() {
        Vec::new()
    } else {
        root_ids
            .split(',')
            .map(|s| {
                let id: u64 = s
                    .parse()
                    .map_err(|_| LarchError::FormatProblem(format!("malformed root_ids entry {s}")))?;
                Ok(NodeId(id))
            })
            .collect::<Result<Vec<_>>>()?
    };
    Ok((key_size, node_size, last_id, trees))
}

/// `key_size` is a correctness parameter baked into every encoded key on
/// disk; unlike `node_size` it cannot be silently reconciled at reopen.
fn check_key_size(config: &ForestConfig, persisted: usize) -> Result<()> {
    if config.key_size as usize != persisted {
        return Err(LarchError::FormatProblem(format!(
            "forest was created with key_size {persisted}, but {} was requested",
            config.key_size
        )));
    }
    Ok(())
}

/// A collection of copy-on-write B-trees sharing one [`NodeStore`].
pub struct Forest<S: NodeStore> {
    store: S,
    trees: Vec<Option<BTree>>,
    poisoned: bool,
    key_size: usize,
    node_size: usize,
    min_index_length: usize,
    max_index_length: usize,
    metadata_path: PathBuf,
}

impl Forest<DiskNodeStore> {
    pub fn create(dir: impl Into<PathBuf>, config: ForestConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let key_size = config.key_size as usize;
        let store = DiskNodeStore::open(
            dir.clone(),
            key_size,
            config.node_size,
            0,
            config.read_cache_size,
            config.upload_queue_size,
            false,
        )?;
        let mut forest = Forest::new(store, Vec::new(), key_size, config.node_size, dir.join(METADATA_FILE));
        forest.commit()?;
        Ok(forest)
    }

    pub fn open(dir: impl Into<PathBuf>, config: ForestConfig) -> Result<Self> {
        let dir = dir.into();
        Journal::recover(&dir)?;
        let metadata_path = dir.join(METADATA_FILE);
        let bytes = fs::read(&metadata_path)?;
        let (key_size, node_size, last_id, tree_roots) = decode_metadata(&bytes)?;
        check_key_size(&config, key_size)?;

        let store = DiskNodeStore::open(
            dir.clone(),
            key_size,
            node_size,
            last_id,
            config.read_cache_size,
            config.upload_queue_size,
            false,
        )?;
        let trees = tree_roots
            .into_iter()
            .map(|root| Some(BTree::with_root(root, key_size, node_size)))
            .collect();
        Ok(Forest::new(store, trees, key_size, node_size, metadata_path))
    }

    pub fn open_read_only(dir: impl Into<PathBuf>, config: ForestConfig) -> Result<Self> {
        let dir = dir.into();
        let metadata_path = dir.join(METADATA_FILE);
        let bytes = fs::read(&metadata_path)?;
        let (key_size, node_size, last_id, tree_roots) = decode_metadata(&bytes)?;
        check_key_size(&config, key_size)?;

        let store = DiskNodeStore::open(
            dir.clone(),
            key_size,
            node_size,
            last_id,
            config.read_cache_size,
            config.upload_queue_size,
            true,
        )?;
        let trees = tree_roots
            .into_iter()
            .map(|root| Some(BTree::with_root(root, key_size, node_size)))
            .collect();
        Ok(Forest::new(store, trees, key_size, node_size, metadata_path))
    }
}

impl Forest<MemNodeStore> {
    pub fn new_in_memory(config: ForestConfig) -> Self {
        let key_size = config.key_size as usize;
        let store = MemNodeStore::new(key_size, config.node_size);
        Forest::new(store, Vec::new(), key_size, config.node_size, PathBuf::new())
    }
}

impl<S: NodeStore> Forest<S> {
    fn new(store: S, trees: Vec<Option<BTree>>, key_size: usize, node_size: usize, metadata_path: PathBuf) -> Self {
        let (min_index_length, max_index_length) = compute_index_bounds(node_size, key_size);
        Forest {
            store,
            trees,
            poisoned: false,
            key_size,
            node_size,
            min_index_length,
            max_index_length,
            metadata_path,
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.poisoned {
            Err(LarchError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Poisons the forest if `result` is one of the unrecoverable errors;
    /// always returns `result` unchanged.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if matches!(
                e,
                LarchError::JournalReplayFailed(_) | LarchError::NodeMissing(_) | LarchError::CorruptNode(_)
            ) {
                tracing::error!(error = %e, "forest poisoned");
                self.poisoned = true;
            }
        }
        result
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn max_value_size(&self) -> usize {
        max_value_size(self.node_size, self.key_size)
    }

    pub fn new_tree(&mut self) -> TreeId {
        self.trees.push(Some(BTree::empty(self.key_size, self.node_size)));
        TreeId(self.trees.len() - 1)
    }

    pub fn new_tree_from(&mut self, source: TreeId) -> Result<TreeId> {
        self.check_alive()?;
        let source_tree = *self.trees[source.0].as_ref().expect("invalid tree handle");
        let result = BTree::cloned_from(&mut self.store, &source_tree);
        let tree = self.guard(result)?;
        self.trees.push(Some(tree));
        Ok(TreeId(self.trees.len() - 1))
    }

    pub fn remove_tree(&mut self, id: TreeId) -> Result<()> {
        self.check_alive()?;
        let tree = self.trees[id.0].take().expect("invalid tree handle");
        let result = tree.destroy(&mut self.store);
        self.guard(result)
    }

    pub fn insert(&mut self, id: TreeId, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check_alive()?;
        let result = {
            let tree = self.trees[id.0].as_mut().expect("invalid tree handle");
            tree.insert(&mut self.store, key, value)
        };
        self.guard(result)
    }

    pub fn lookup(&mut self, id: TreeId, key: &[u8]) -> Result<Vec<u8>> {
        self.check_alive()?;
        let result = {
            let tree = self.trees[id.0].as_ref().expect("invalid tree handle");
            tree.lookup(&mut self.store, key)
        };
        self.guard(result)
    }

    pub fn remove(&mut self, id: TreeId, key: &[u8]) -> Result<()> {
        self.check_alive()?;
        let result = {
            let tree = self.trees[id.0].as_mut().expect("invalid tree handle");
            tree.remove(&mut self.store, key)
        };
        self.guard(result)
    }

    pub fn remove_range(&mut self, id: TreeId, lo: &[u8], hi: &[u8]) -> Result<()> {
        self.check_alive()?;
        let result = {
            let tree = self.trees[id.0].as_mut().expect("invalid tree handle");
            tree.remove_range(&mut self.store, lo, hi)
        };
        self.guard(result)
    }

    pub fn lookup_range(&mut self, id: TreeId, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_alive()?;
        let result = {
            let tree = self.trees[id.0].as_ref().expect("invalid tree handle");
            tree.lookup_range(&mut self.store, lo, hi)
        };
        self.guard(result)
    }

    pub fn count_range(&mut self, id: TreeId, lo: &[u8], hi: &[u8]) -> Result<u64> {
        self.check_alive()?;
        let result = {
            let tree = self.trees[id.0].as_ref().expect("invalid tree handle");
            tree.count_range(&mut self.store, lo, hi)
        };
        self.guard(result)
    }

    pub fn range_is_empty(&mut self, id: TreeId, lo: &[u8], hi: &[u8]) -> Result<bool> {
        self.check_alive()?;
        let result = {
            let tree = self.trees[id.0].as_ref().expect("invalid tree handle");
            tree.range_is_empty(&mut self.store, lo, hi)
        };
        self.guard(result)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.check_alive()?;
        let bytes = encode_metadata(self.key_size, self.node_size, self.store.last_id(), &self.trees);
        self.store.stage_extra_write(self.metadata_path.clone(), bytes);
        let root_count = self.trees.iter().flatten().count();
        let result = self.store.commit();
        if result.is_ok() {
            tracing::debug!(root_count, "forest committed");
        }
        self.guard(result)
    }

    /// Read-only consistency walk over every live tree: oversized nodes,
    /// index fill bounds, leftmost-key maintenance, dangling children,
    /// refcount accounting, and unreachable-but-still-referenced nodes.
    /// Exists for an external `fsck`-style tool; never called internally.
    pub fn walk(&mut self) -> Result<Vec<Violation>> {
        self.check_alive()?;
        let mut violations = Vec::new();
        let mut observed: AHashMap<NodeId, u32> = AHashMap::new();
        let roots: AHashSet<NodeId> = self
            .trees
            .iter()
            .flatten()
            .map(|t| t.root())
            .filter(|r| r.is_some())
            .collect();

        for root in &roots {
            *observed.entry(*root).or_insert(0) += 1;
        }

        let mut stack: Vec<NodeId> = roots.iter().copied().collect();
        while let Some(id) = stack.pop() {
            let node = match self.store.get_node(id) {
                Ok(n) => n,
                Err(LarchError::NodeMissing(_)) => continue,
                Err(e) => return Err(e),
            };

            if node.encoded_size() > self.node_size {
                violations.push(Violation::OversizedNode {
                    id,
                    size: node.encoded_size(),
                    limit: self.node_size,
                });
            }

            if let Node::Index(idx) = &node {
                if idx.len() > self.max_index_length {
                    violations.push(Violation::IndexOverfilled {
                        id,
                        len: idx.len(),
                        max: self.max_index_length,
                    });
                }
                if idx.len() < self.min_index_length && !roots.contains(&id) {
                    violations.push(Violation::IndexUnderfilled {
                        id,
                        len: idx.len(),
                        min: self.min_index_length,
                    });
                }

                for (key, child) in idx.entries() {
                    *observed.entry(*child).or_insert(0) += 1;
                    match self.store.get_node(*child) {
                        Ok(child_node) => {
                            if child_node.first_key() != Some(key) {
                                violations.push(Violation::LeftmostKeyMismatch { parent: id, child: *child });
                            }
                        }
                        Err(LarchError::NodeMissing(_)) => {
                            violations.push(Violation::DanglingReference { parent: id, child: *child });
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    stack.push(*child);
                }
            }
        }

        for (&id, &count) in &observed {
            let stored = self.store.get_refcount(id)?;
            if stored as u32 != count {
                violations.push(Violation::RefcountMismatch { id, observed: count, stored });
            }
        }
        for id in self.store.list_node_ids()? {
            if !observed.contains_key(&id) {
                let stored = self.store.get_refcount(id)?;
                if stored > 0 {
                    violations.push(Violation::LeakedNode { id, stored });
                }
            }
        }

        Ok(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ForestConfig {
        ForestConfig::new(4, 128)
    }

    fn key(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    #[test]
    fn metadata_round_trips_and_compacts_removed_slots() {
        let trees = vec![
            Some(BTree::with_root(NodeId(5), 4, 128)),
            None, // previously removed
            Some(BTree::empty(4, 128)),
        ];
        let bytes = encode_metadata(4, 128, 9, &trees);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("format 1/1\n"));
        assert!(text.contains("root_ids 5,0\n"));

        let (key_size, node_size, last_id, root_ids) = decode_metadata(&bytes).unwrap();
        assert_eq!(key_size, 4);
        assert_eq!(node_size, 128);
        assert_eq!(last_id, 9);
        assert_eq!(root_ids, vec![NodeId(5), NodeId::NONE]);
    }

    #[test]
    fn decode_rejects_unknown_format() {
        let bytes = b"format 2/0\nnode_size 128\nkey_size 4\nlast_id 0\nroot_ids \n".to_vec();
        assert!(matches!(decode_metadata(&bytes), Err(LarchError::FormatProblem(_))));
    }

    #[test]
    fn remove_tree_then_reopen_drops_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut forest = Forest::create(dir.path(), config()).unwrap();
        let a = forest.new_tree();
        forest.insert(a, key(1), key(1)).unwrap();
        let b = forest.new_tree();
        forest.insert(b, key(2), key(2)).unwrap();
        forest.remove_tree(a).unwrap();
        forest.commit().unwrap();
        drop(forest);

        let mut reopened = Forest::open(dir.path(), config()).unwrap();
        // Only tree `b`'s root survives; it is renumbered to slot 0.
        assert_eq!(reopened.lookup(TreeId(0), &key(2)).unwrap(), key(2));
    }

    #[test]
    fn remove_tree_after_fresh_reopen_reads_nodes_not_yet_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut forest = Forest::create(dir.path(), config()).unwrap();
        let a = forest.new_tree();
        for i in 0..200u32 {
            forest.insert(a, key(i), key(i)).unwrap();
        }
        let b = forest.new_tree();
        forest.insert(b, key(9000), key(9000)).unwrap();
        forest.commit().unwrap();
        drop(forest);

        // Fresh forest: read_cache and upload_queue are both empty, so
        // every node on `a`'s way down has to come from the journal/disk,
        // not from something still warm from an earlier op.
        let mut reopened = Forest::open(dir.path(), config()).unwrap();
        reopened.remove_tree(a).unwrap();
        reopened.commit().unwrap();

        assert_eq!(reopened.lookup(b, &key(9000)).unwrap(), key(9000));
    }

    #[test]
    fn new_tree_starts_empty() {
        let mut forest = Forest::new_in_memory(config());
        let t = forest.new_tree();
        assert!(matches!(forest.lookup(t, &key(1)), Err(LarchError::KeyNotFound)));
    }

    #[test]
    fn clone_then_mutate_does_not_affect_source() {
        let mut forest = Forest::new_in_memory(config());
        let a = forest.new_tree();
        for i in 0..50u32 {
            forest.insert(a, key(i), key(i)).unwrap();
        }
        let b = forest.new_tree_from(a).unwrap();
        forest.remove(b, &key(3)).unwrap();

        assert!(forest.lookup(a, &key(3)).is_ok());
        assert!(forest.lookup(b, &key(3)).is_err());
        assert_eq!(forest.count_range(a, &key(0), &key(u32::MAX)).unwrap(), 50);
        assert_eq!(forest.count_range(b, &key(0), &key(u32::MAX)).unwrap(), 49);
    }

    #[test]
    fn remove_tree_frees_its_unique_nodes() {
        let mut forest = Forest::new_in_memory(config());
        let a = forest.new_tree();
        for i in 0..200u32 {
            forest.insert(a, key(i), key(i)).unwrap();
        }
        forest.remove_tree(a).unwrap();
        let violations = forest.walk().unwrap();
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn walk_reports_no_violations_on_a_healthy_forest() {
        let mut forest = Forest::new_in_memory(config());
        let a = forest.new_tree();
        for i in 0..500u32 {
            forest.insert(a, key(i), key(i)).unwrap();
        }
        let b = forest.new_tree_from(a).unwrap();
        for i in (0..500u32).step_by(3) {
            forest.remove(b, &key(i)).unwrap();
        }
        let violations = forest.walk().unwrap();
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn create_commit_open_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut forest = Forest::create(dir.path(), config()).unwrap();
        let t = forest.new_tree();
        for i in 0..300u32 {
            forest.insert(t, key(i), key(i)).unwrap();
        }
        forest.commit().unwrap();
        drop(forest);

        let mut reopened = Forest::open(dir.path(), config()).unwrap();
        for i in 0..300u32 {
            assert_eq!(reopened.lookup(t, &key(i)).unwrap(), key(i));
        }
    }

    #[test]
    fn poisoned_forest_rejects_further_calls() {
        let mut forest = Forest::new_in_memory(config());
        let t = forest.new_tree();
        forest.poisoned = true;
        assert!(matches!(forest.insert(t, key(1), key(1)), Err(LarchError::Poisoned)));
        assert!(matches!(forest.lookup(t, &key(1)), Err(LarchError::Poisoned)));
    }
}
