// src/store/memory.rs
// In-memory NodeStore variant: no journal, no disk, no caches — every
// node lives in a HashMap for the lifetime of the process. Used for
// tests and for forests that are deliberately never persisted.

use std::collections::HashMap;

use super::NodeStore;
use crate::error::{LarchError, Result};
use crate::key::NodeId;
use crate::node::Node;

pub struct MemNodeStore {
    key_size: usize,
    node_size: usize,
    read_only: bool,
    last_id: u64,
    nodes: HashMap<NodeId, Node>,
    refcounts: HashMap<NodeId, u16>,
}

impl MemNodeStore {
    pub fn new(key_size: usize, node_size: usize) -> Self {
        MemNodeStore {
            key_size,
            node_size,
            read_only: false,
            last_id: 0,
            nodes: HashMap::new(),
            refcounts: HashMap::new(),
        }
    }
}

impl NodeStore for MemNodeStore {
    fn key_size(&self) -> usize {
        self.key_size
    }

    fn node_size(&self) -> usize {
        self.node_size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn last_id(&self) -> u64 {
        self.last_id
    }

    fn get_node(&mut self, id: NodeId) -> Result<Node> {
        self.nodes
            .get(&id)
            .cloned()
            .ok_or(LarchError::NodeMissing(id.0))
    }

    fn list_node_ids(&mut self) -> Result<Vec<NodeId>> {
        Ok(self.nodes.keys().copied().collect())
    }

    fn new_id(&mut self) -> Result<NodeId> {
        self.assert_writable()?;
        self.last_id += 1;
        Ok(NodeId(self.last_id))
    }

    fn put_node(&mut self, node: Node) -> Result<()> {
        self.assert_writable()?;
        self.nodes.insert(node.id(), node);
        Ok(())
    }

    fn remove_node(&mut self, id: NodeId) -> Result<()> {
        self.assert_writable()?;
        self.nodes.remove(&id);
        Ok(())
    }

    fn get_refcount(&mut self, id: NodeId) -> Result<u16> {
        Ok(*self.refcounts.get(&id).unwrap_or(&0))
    }

    fn incr_refcount(&mut self, id: NodeId) -> Result<u16> {
        self.assert_writable()?;
        let entry = self.refcounts.entry(id).or_insert(0);
        *entry = entry.checked_add(1).ok_or(LarchError::RefcountOverflow(id.0))?;
        Ok(*entry)
    }

    fn decr_refcount(&mut self, id: NodeId) -> Result<u16> {
        self.assert_writable()?;
        let entry = self.refcounts.entry(id).or_insert(0);
        *entry = entry.saturating_sub(1);
        let value = *entry;
        if value == 0 {
            self.refcounts.remove(&id);
        }
        Ok(value)
    }

    fn set_refcount(&mut self, id: NodeId, value: u16) -> Result<()> {
        self.assert_writable()?;
        if value == 0 {
            self.refcounts.remove(&id);
        } else {
            self.refcounts.insert(id, value);
        }
        Ok(())
    }

    fn stage_extra_write(&mut self, _path: std::path::PathBuf, _content: Vec<u8>) {}

    fn commit(&mut self) -> Result<()> {
        self.assert_writable()
    }
}
