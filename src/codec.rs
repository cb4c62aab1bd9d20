// src/codec.rs
// Pure encode/decode of leaf and index nodes to/from fixed-format byte
// blocks. No I/O lives here — NodeStore owns reading/writing the blocks
// this module produces and consumes.

use crate::error::{LarchError, Result};
use crate::key::{Key, NodeId};
use crate::node::{IndexNode, LeafNode};

const LEAF_MAGIC: [u8; 4] = *b"ORBL";
const INDEX_MAGIC: [u8; 4] = *b"ORBI";

/// Fixed bytes at the head of every encoded node: magic + node_id + count.
const LEAF_HEADER_SIZE: usize = 4 + 8 + 4;
const INDEX_HEADER_SIZE: usize = 4 + 8 + 4;

/// Encoded size contribution of one leaf pair's fixed-width fields
/// (the key itself, plus its 4-byte value-length slot). The value bytes
/// are variable and added on top of this per pair.
pub fn leaf_pair_fixed_size(key_size: usize) -> usize {
    key_size + 4
}

/// Encoded size contribution of one index entry (key + child id).
pub fn index_entry_size(key_size: usize) -> usize {
    key_size + 8
}

pub fn leaf_header_size() -> usize {
    LEAF_HEADER_SIZE
}

pub fn index_header_size() -> usize {
    INDEX_HEADER_SIZE
}

/// `encoded_size` computed from scratch — used at node construction and by
/// tests that check incremental bookkeeping against the ground truth.
pub fn leaf_encoded_size(key_size: usize, pairs: &[(Key, Vec<u8>)]) -> usize {
    let mut size = LEAF_HEADER_SIZE;
    for (_, value) in pairs {
        size += leaf_pair_fixed_size(key_size) + value.len();
    }
    size
}

pub fn index_encoded_size(key_size: usize, entries: &[(Key, NodeId)]) -> usize {
    INDEX_HEADER_SIZE + entries.len() * index_entry_size(key_size)
}

pub fn encode_leaf(node: &LeafNode, key_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(node.encoded_size());
    buf.extend_from_slice(&LEAF_MAGIC);
    buf.extend_from_slice(&node.id().0.to_be_bytes());
    buf.extend_from_slice(&(node.pairs().len() as u32).to_be_bytes());

    for (key, _) in node.pairs() {
        debug_assert_eq!(key.len(), key_size);
        buf.extend_from_slice(key.as_bytes());
    }
    for (_, value) in node.pairs() {
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    }
    for (_, value) in node.pairs() {
        buf.extend_from_slice(value);
    }
    buf
}

pub fn encode_index(node: &IndexNode, key_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(node.encoded_size());
    buf.extend_from_slice(&INDEX_MAGIC);
    buf.extend_from_slice(&node.id().0.to_be_bytes());
    buf.extend_from_slice(&(node.entries().len() as u32).to_be_bytes());

    for (key, _) in node.entries() {
        debug_assert_eq!(key.len(), key_size);
        buf.extend_from_slice(key.as_bytes());
    }
    for (_, child) in node.entries() {
        buf.extend_from_slice(&child.0.to_be_bytes());
    }
    buf
}

fn take(buf: &[u8], offset: &mut usize, len: usize) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| LarchError::CorruptNode("length overflow".into()))?;
    if end > buf.len() {
        return Err(LarchError::CorruptNode(format!(
            "declared length overruns buffer: need {} bytes, have {}",
            end,
            buf.len()
        )));
    }
    let range = *offset..end;
    *offset = end;
    Ok(range)
}

pub fn decode_leaf(buf: &[u8], key_size: usize) -> Result<LeafNode> {
    if buf.len() < LEAF_HEADER_SIZE || buf[0..4] != LEAF_MAGIC {
        return Err(LarchError::CorruptNode("unknown leaf magic".into()));
    }
    let mut offset = 4;
    let id_range = take(buf, &mut offset, 8)?;
    let id = NodeId(u64::from_be_bytes(buf[id_range].try_into().unwrap()));
    if id.is_none() {
        return Err(LarchError::CorruptNode("decoded node id is 0".into()));
    }
    let count_range = take(buf, &mut offset, 4)?;
    let pair_count = u32::from_be_bytes(buf[count_range].try_into().unwrap()) as usize;

    let mut keys = Vec::with_capacity(pair_count);
    for _ in 0..pair_count {
        let range = take(buf, &mut offset, key_size)?;
        keys.push(Key::from_raw(buf[range].to_vec()));
    }

    let mut value_lens = Vec::with_capacity(pair_count);
    for _ in 0..pair_count {
        let range = take(buf, &mut offset, 4)?;
        value_lens.push(u32::from_be_bytes(buf[range].try_into().unwrap()) as usize);
    }

    let mut pairs = Vec::with_capacity(pair_count);
    for (key, len) in keys.into_iter().zip(value_lens) {
        let range = take(buf, &mut offset, len)?;
        pairs.push((key, buf[range].to_vec()));
    }

    Ok(LeafNode::from_parts(id, pairs))
}

pub fn decode_index(buf: &[u8], key_size: usize) -> Result<IndexNode> {
    if buf.len() < INDEX_HEADER_SIZE || buf[0..4] != INDEX_MAGIC {
        return Err(LarchError::CorruptNode("unknown index magic".into()));
    }
    let mut offset = 4;
    let id_range = take(buf, &mut offset, 8)?;
    let id = NodeId(u64::from_be_bytes(buf[id_range].try_into().unwrap()));
    if id.is_none() {
        return Err(LarchError::CorruptNode("decoded node id is 0".into()));
    }
    let count_range = take(buf, &mut offset, 4)?;
    let entry_count = u32::from_be_bytes(buf[count_range].try_into().unwrap()) as usize;

    let mut keys = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let range = take(buf, &mut offset, key_size)?;
        keys.push(Key::from_raw(buf[range].to_vec()));
    }

    let mut children = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let range = take(buf, &mut offset, 8)?;
        children.push(NodeId(u64::from_be_bytes(buf[range].try_into().unwrap())));
    }

    let entries = keys.into_iter().zip(children).collect();
    Ok(IndexNode::from_parts(id, entries))
}
