// src/store/mod.rs
// NodeStore is a capability set — get/put/remove a node, allocate ids,
// adjust refcounts, commit — rather than a concrete type. BTree and
// Forest are generic over `S: NodeStore`, never over `dyn NodeStore`:
// a forest has exactly one concrete store for its whole lifetime, so
// monomorphizing keeps the hot get_node/put_node path off a vtable.

mod disk;
mod memory;
mod path;

pub use disk::DiskNodeStore;
pub use memory::MemNodeStore;

use crate::codec;
use crate::error::{LarchError, Result};
use crate::key::NodeId;
use crate::node::{IndexNode, LeafNode, Node};

pub trait NodeStore {
    fn key_size(&self) -> usize;
    fn node_size(&self) -> usize;
    fn is_read_only(&self) -> bool;

    /// Highest id ever allocated. Forest persists this in its metadata.
    fn last_id(&self) -> u64;

    fn get_node(&mut self, id: NodeId) -> Result<Node>;
    fn list_node_ids(&mut self) -> Result<Vec<NodeId>>;

    fn new_id(&mut self) -> Result<NodeId>;
    fn put_node(&mut self, node: Node) -> Result<()>;
    fn remove_node(&mut self, id: NodeId) -> Result<()>;

    fn get_refcount(&mut self, id: NodeId) -> Result<u16>;
    fn incr_refcount(&mut self, id: NodeId) -> Result<u16>;
    fn decr_refcount(&mut self, id: NodeId) -> Result<u16>;
    /// Overwrites a refcount directly. Used by `fsck`-style `--fix` repairs
    /// and by tests that need to provoke the overflow guard without
    /// actually performing 65535 clones.
    fn set_refcount(&mut self, id: NodeId, value: u16) -> Result<()>;

    /// Stages an extra file write into this store's commit transaction.
    /// Used by `Forest::commit` to fold the metadata file write into the
    /// same atomic journal batch as the node/refcount flush.
    fn stage_extra_write(&mut self, path: std::path::PathBuf, content: Vec<u8>);

    /// Flushes dirty nodes, refcounts and any staged extra writes through
    /// the journal (no-op for the in-memory store).
    fn commit(&mut self) -> Result<()>;

    fn assert_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(LarchError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

fn encode_node(node: &Node, key_size: usize) -> Vec<u8> {
    match node {
        Node::Leaf(l) => codec::encode_leaf(l, key_size),
        Node::Index(i) => codec::encode_index(i, key_size),
    }
}

fn decode_node(buf: &[u8], key_size: usize) -> Result<Node> {
    if buf.len() < 4 {
        return Err(LarchError::CorruptNode("buffer too small for magic".into()));
    }
    match &buf[0..4] {
        b"ORBL" => Ok(Node::Leaf(codec::decode_leaf(buf, key_size)?)),
        b"ORBI" => Ok(Node::Index(codec::decode_index(buf, key_size)?)),
        other => Err(LarchError::CorruptNode(format!(
            "unknown node magic {other:?}"
        ))),
    }
}

#[allow(dead_code)]
fn empty_leaf(id: NodeId) -> Node {
    Node::Leaf(LeafNode::new(id))
}

#[allow(dead_code)]
fn empty_index(id: NodeId) -> Node {
    Node::Index(IndexNode::new(id))
}
