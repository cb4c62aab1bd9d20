// src/key.rs
use crate::error::{LarchError, Result};

/// A fixed-length key. Every key in a given forest has the same length
/// (`key_size`, forest-wide); construction validates this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: Vec<u8>, key_size: usize) -> Result<Self> {
        if bytes.len() != key_size {
            return Err(LarchError::WrongKeySize {
                expected: key_size,
                actual: bytes.len(),
            });
        }
        Ok(Key(bytes))
    }

    /// Wraps bytes already known to be the right length (codec decode path).
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 64-bit node identifier, monotonic per forest. `NodeId::NONE` (0) means
/// "no node" — an empty tree's root, or a missing child slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const NONE: NodeId = NodeId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_rejects_wrong_length() {
        assert!(Key::new(vec![1, 2, 3], 4).is_err());
        assert!(Key::new(vec![1, 2, 3, 4], 4).is_ok());
    }

    #[test]
    fn node_id_none_is_zero() {
        assert!(NodeId::NONE.is_none());
        assert!(NodeId(1).is_some());
    }
}
