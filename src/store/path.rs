// src/store/path.rs
// Deterministic sharding of a NodeId into a multi-level directory path,
// so that no single directory under `nodes/` ever holds more than 65536
// entries. The split is a property of the disk store only — it must
// round-trip (id -> path -> id) and nothing else depends on its shape.

use std::path::{Path, PathBuf};

use crate::error::{LarchError, Result};
use crate::key::NodeId;

const COMPONENT_HEX_WIDTH: usize = 4;
const COMPONENTS: usize = 4;

pub fn id_to_path(id: NodeId) -> PathBuf {
    let hex = format!("{:016x}", id.0);
    let mut path = PathBuf::new();
    for i in 0..COMPONENTS {
        let start = i * COMPONENT_HEX_WIDTH;
        path.push(&hex[start..start + COMPONENT_HEX_WIDTH]);
    }
    path
}

pub fn path_to_id(path: &Path) -> Result<NodeId> {
    let mut hex = String::with_capacity(COMPONENT_HEX_WIDTH * COMPONENTS);
    for component in path.components() {
        let s = component.as_os_str().to_str().ok_or_else(|| {
            LarchError::CorruptNode("non-utf8 node path component".into())
        })?;
        hex.push_str(s);
    }
    if hex.len() != COMPONENT_HEX_WIDTH * COMPONENTS {
        return Err(LarchError::CorruptNode(format!(
            "malformed node path {}",
            path.display()
        )));
    }
    let value = u64::from_str_radix(&hex, 16)
        .map_err(|e| LarchError::CorruptNode(format!("malformed node path: {e}")))?;
    Ok(NodeId(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_path_round_trips() {
        for id in [1u64, 42, 65536, u64::MAX, BUCKET_SAMPLE] {
            let path = id_to_path(NodeId(id));
            let back = path_to_id(&path).unwrap();
            assert_eq!(back, NodeId(id));
        }
    }

    const BUCKET_SAMPLE: u64 = 32768 * 7 + 123;

    #[test]
    fn path_has_four_components() {
        let path = id_to_path(NodeId(12345));
        assert_eq!(path.components().count(), 4);
    }
}
