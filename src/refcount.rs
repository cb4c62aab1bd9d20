// src/refcount.rs
// Persistent NodeId -> u16 refcount map, bucketed across fixed-size files
// so no single file holds more than BUCKET_SIZE counters. Buckets are
// lazily loaded and cached; dirty buckets are written back through the
// journal at commit (see store::disk::DiskNodeStore::commit).

use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::error::{LarchError, Result};
use crate::journal::Journal;
use crate::key::NodeId;

pub const BUCKET_SIZE: u64 = 32768;

fn bucket_of(id: NodeId) -> u64 {
    id.0 % BUCKET_SIZE
}

fn slot_of(id: NodeId) -> usize {
    (id.0 / BUCKET_SIZE) as usize
}

fn bucket_path(dir: &Path, bucket: u64) -> PathBuf {
    dir.join(format!("refcount-{}", bucket))
}

struct Bucket {
    counts: Vec<u16>,
    dirty: bool,
}

impl Bucket {
    fn empty() -> Self {
        Bucket {
            counts: vec![0u16; BUCKET_SIZE as usize],
            dirty: false,
        }
    }

    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let bytes = std::fs::read(path)?;
        if bytes.len() != (BUCKET_SIZE as usize) * 2 {
            return Err(LarchError::FormatProblem(format!(
                "refcount bucket {} has unexpected length {}",
                path.display(),
                bytes.len()
            )));
        }
        let counts = bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Bucket {
            counts,
            dirty: false,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.counts.len() * 2);
        for c in &self.counts {
            buf.extend_from_slice(&c.to_be_bytes());
        }
        buf
    }

    fn is_all_zero(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }
}

/// Bucketed, lazily-loaded refcount store rooted at `dirname/refcounts/`.
pub struct RefcountStore {
    dir: PathBuf,
    buckets: AHashMap<u64, Bucket>,
}

impl RefcountStore {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        RefcountStore {
            dir: dir.into(),
            buckets: AHashMap::new(),
        }
    }

    fn bucket_mut(&mut self, id: NodeId) -> Result<&mut Bucket> {
        let bucket_idx = bucket_of(id);
        if !self.buckets.contains_key(&bucket_idx) {
            let bucket = Bucket::load(&bucket_path(&self.dir, bucket_idx))?;
            self.buckets.insert(bucket_idx, bucket);
        }
        Ok(self.buckets.get_mut(&bucket_idx).unwrap())
    }

    pub fn get(&mut self, id: NodeId) -> Result<u16> {
        let slot = slot_of(id);
        Ok(self.bucket_mut(id)?.counts[slot])
    }

    pub fn set(&mut self, id: NodeId, value: u16) -> Result<()> {
        let slot = slot_of(id);
        let bucket = self.bucket_mut(id)?;
        bucket.counts[slot] = value;
        bucket.dirty = true;
        Ok(())
    }

    /// Increments the refcount of `id`, failing rather than wrapping if
    /// it would exceed u16::MAX (spec §8 scenario 5).
    pub fn incr(&mut self, id: NodeId) -> Result<u16> {
        let slot = slot_of(id);
        let bucket = self.bucket_mut(id)?;
        let current = bucket.counts[slot];
        let next = current
            .checked_add(1)
            .ok_or(LarchError::RefcountOverflow(id.0))?;
        bucket.counts[slot] = next;
        bucket.dirty = true;
        Ok(next)
    }

    /// Decrements the refcount of `id`, returning the new value. Saturates
    /// at zero defensively; callers never decrement below what they hold.
    pub fn decr(&mut self, id: NodeId) -> Result<u16> {
        let slot = slot_of(id);
        let bucket = self.bucket_mut(id)?;
        let next = bucket.counts[slot].saturating_sub(1);
        bucket.counts[slot] = next;
        bucket.dirty = true;
        Ok(next)
    }

    /// Flushes dirty buckets through `journal`: non-zero buckets are
    /// (over)written, all-zero buckets are deleted so an unreferenced
    /// range of ids leaves no file behind.
    pub fn flush(&mut self, journal: &mut Journal) -> Result<()> {
        for (bucket_idx, bucket) in self.buckets.iter_mut() {
            if !bucket.dirty {
                continue;
            }
            let path = bucket_path(&self.dir, *bucket_idx);
            if bucket.is_all_zero() {
                journal.stage_delete(path);
            } else {
                journal.stage_write(path, bucket.encode());
            }
            bucket.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_bucket_reads_as_zero() {
        let dir = tempdir().unwrap();
        let mut store = RefcountStore::open(dir.path().join("refcounts"));
        assert_eq!(store.get(NodeId(42)).unwrap(), 0);
    }

    #[test]
    fn incr_decr_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = RefcountStore::open(dir.path().join("refcounts"));
        assert_eq!(store.incr(NodeId(1)).unwrap(), 1);
        assert_eq!(store.incr(NodeId(1)).unwrap(), 2);
        assert_eq!(store.decr(NodeId(1)).unwrap(), 1);
        assert_eq!(store.get(NodeId(1)).unwrap(), 1);
    }

    #[test]
    fn incr_rejects_overflow() {
        let dir = tempdir().unwrap();
        let mut store = RefcountStore::open(dir.path().join("refcounts"));
        store.set(NodeId(1), u16::MAX).unwrap();
        assert!(matches!(
            store.incr(NodeId(1)),
            Err(LarchError::RefcountOverflow(1))
        ));
    }

    #[test]
    fn bucketing_spans_ids_correctly() {
        let a = NodeId(BUCKET_SIZE);
        let b = NodeId(BUCKET_SIZE * 3 + 5);
        assert_eq!(bucket_of(a), 0);
        assert_eq!(slot_of(a), 1);
        assert_eq!(bucket_of(b), 5);
        assert_eq!(slot_of(b), 3);
    }
}
