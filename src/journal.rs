// src/journal.rs
// Atomic multi-file batch: writes and deletes are staged under shadow
// paths, then published in one commit that is crash-safe to replay.
//
// Protocol (spec §4.4):
//   1. every staged write is fsync'd to its shadow path `P.new`
//   2. a manifest listing every (write, delete) target is itself staged
//      and fsync'd, then a small commit record is written — its presence
//      is what makes the transaction durable
//   3. rotate: shadows are renamed onto their final paths, tombstones
//      are unlinked
//   4. the commit record and manifest are removed
//
// On open, a present commit record means phase 3 must be (re)played; its
// absence means every `*.new` shadow found on disk is orphaned and is
// removed instead.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{LarchError, Result};

const MANIFEST_NAME: &str = "journal.manifest";
const COMMIT_NAME: &str = "journal.commit";
const SHADOW_SUFFIX: &str = ".new";

fn shadow_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(SHADOW_SUFFIX);
    PathBuf::from(s)
}

pub struct Journal {
    root: PathBuf,
    writes: HashMap<PathBuf, Vec<u8>>,
    deletes: HashSet<PathBuf>,
}

impl Journal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Journal {
            root: root.into(),
            writes: HashMap::new(),
            deletes: HashSet::new(),
        }
    }

    /// Stages a write to `path`. Replaces any earlier staged write to the
    /// same path within this transaction (later overrides earlier), and
    /// cancels a pending delete of the same path.
    pub fn stage_write(&mut self, path: PathBuf, content: Vec<u8>) {
        self.deletes.remove(&path);
        self.writes.insert(path, content);
    }

    /// Stages a delete of `path`. A write-then-delete within the same
    /// transaction is collapsed to just the delete.
    pub fn stage_delete(&mut self, path: PathBuf) {
        self.writes.remove(&path);
        self.deletes.insert(path);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    /// Looks up a still-uncommitted staged write by its final path.
    /// Lets a NodeStore serve reads of nodes it has already evicted into
    /// the journal but not yet flushed to disk (a staged write is logically
    /// part of current state until `commit`, even though nothing has been
    /// fsync'd to its final path yet). Returns `None` if `path` is staged
    /// for delete rather than write, or isn't staged at all.
    pub fn peek_write(&self, path: &Path) -> Option<&[u8]> {
        self.writes.get(path).map(|v| v.as_slice())
    }

    /// Every path with a write currently staged (not yet fsync'd). Used by
    /// `DiskNodeStore::list_node_ids` to surface nodes evicted from the
    /// upload queue but not yet committed.
    pub fn staged_write_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.writes.keys()
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_NAME)
    }

    fn commit_path(&self) -> PathBuf {
        self.root.join(COMMIT_NAME)
    }

    fn encode_manifest(&self) -> Vec<u8> {
        let mut buf = String::new();
        for path in self.writes.keys() {
            buf.push_str("W ");
            buf.push_str(&path.to_string_lossy());
            buf.push('\n');
        }
        for path in &self.deletes {
            buf.push_str("D ");
            buf.push_str(&path.to_string_lossy());
            buf.push('\n');
        }
        buf.into_bytes()
    }

    fn decode_manifest(bytes: &[u8]) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| LarchError::JournalReplayFailed(format!("manifest not utf8: {e}")))?;
        let mut writes = Vec::new();
        let mut deletes = Vec::new();
        for line in text.lines() {
            let Some((tag, path)) = line.split_once(' ') else {
                continue;
            };
            match tag {
                "W" => writes.push(PathBuf::from(path)),
                "D" => deletes.push(PathBuf::from(path)),
                _ => {
                    return Err(LarchError::JournalReplayFailed(format!(
                        "unknown manifest entry tag {tag}"
                    )))
                }
            }
        }
        Ok((writes, deletes))
    }

    fn fsync_write(path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = File::create(path)?;
        f.write_all(content)?;
        f.sync_all()?;
        Ok(())
    }

    /// Commits every staged write and delete atomically. No-op if nothing
    /// was staged.
    pub fn commit(&mut self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        for (path, content) in &self.writes {
            Self::fsync_write(&shadow_path(path), content)?;
        }

        let manifest = self.encode_manifest();
        Self::fsync_write(&shadow_path(&self.manifest_path()), &manifest)?;

        let checksum = crc32fast::hash(&manifest);
        Self::fsync_write(&self.commit_path(), &checksum.to_be_bytes())?;

        self.rotate()?;

        fs::remove_file(self.commit_path()).ok();
        self.writes.clear();
        self.deletes.clear();
        Ok(())
    }

    /// Phase 3: rename every shadow onto its final path, unlink every
    /// tombstone. Idempotent — safe to call again on a transaction that
    /// already rotated some of its files.
    fn rotate(&self) -> Result<()> {
        let manifest_shadow = shadow_path(&self.manifest_path());
        if manifest_shadow.exists() {
            fs::rename(&manifest_shadow, self.manifest_path())?;
        }
        if !self.manifest_path().exists() {
            // Already fully rotated by a previous pass; only the commit
            // record's own removal was interrupted.
            return Ok(());
        }
        let manifest_bytes = fs::read(self.manifest_path())?;
        let (writes, deletes) = Self::decode_manifest(&manifest_bytes)?;

        for path in &writes {
            let shadow = shadow_path(path);
            if shadow.exists() {
                fs::rename(&shadow, path)?;
            }
        }
        for path in &deletes {
            fs::remove_file(path).ok();
        }

        fs::remove_file(self.manifest_path()).ok();
        Ok(())
    }

    /// Recovery at open: replays or rolls back any transaction left
    /// behind by a crash. Must be called before any other use of the
    /// directory tree; never call on a read-only open (spec §4.4).
    ///
    /// A commit record whose checksum doesn't match the manifest it
    /// names (a torn write of the commit record itself) is treated as
    /// absent, not present: we roll back rather than replay a batch we
    /// can't trust is the one that was actually fsync'd.
    pub fn recover(root: &Path) -> Result<()> {
        let commit_path = root.join(COMMIT_NAME);
        let manifest_path = root.join(MANIFEST_NAME);

        if commit_path.exists() && Self::commit_record_matches_manifest(root)? {
            let journal = Journal::new(root.to_path_buf());
            journal.rotate().map_err(|e| {
                LarchError::JournalReplayFailed(format!("replay failed: {e}"))
            })?;
            fs::remove_file(&commit_path).ok();
            return Ok(());
        }

        // No commit record, or a corrupt one: any manifest or `.new`
        // shadow found is an orphan from an interrupted transaction.
        // Roll back by deleting.
        fs::remove_file(&commit_path).ok();
        fs::remove_file(&manifest_path).ok();
        fs::remove_file(shadow_path(&manifest_path)).ok();
        remove_shadows_recursive(root)
    }

    /// Reads the commit record and the manifest it refers to (shadow
    /// path if rotation hasn't happened yet, final path if recovery is
    /// being retried after a partial rotate) and checks the checksum.
    fn commit_record_matches_manifest(root: &Path) -> Result<bool> {
        let commit_path = root.join(COMMIT_NAME);
        let commit_bytes = fs::read(&commit_path)?;
        if commit_bytes.len() != 4 {
            return Ok(false);
        }
        let expected = u32::from_be_bytes(commit_bytes.try_into().unwrap());

        let manifest_path = root.join(MANIFEST_NAME);
        let manifest_shadow = shadow_path(&manifest_path);
        let manifest_bytes = if manifest_shadow.exists() {
            fs::read(&manifest_shadow)?
        } else if manifest_path.exists() {
            fs::read(&manifest_path)?
        } else {
            return Ok(false);
        };

        Ok(crc32fast::hash(&manifest_bytes) == expected)
    }
}

fn remove_shadows_recursive(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            remove_shadows_recursive(&path)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("new") {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn commit_writes_and_deletes_are_visible_after_rotate() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nodes")).unwrap();
        let target = dir.path().join("nodes").join("a");
        fs::write(&target, b"old").unwrap();

        let mut journal = Journal::new(dir.path());
        journal.stage_write(target.clone(), b"new".to_vec());
        journal.stage_delete(dir.path().join("gone"));
        journal.commit().unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!dir.path().join("gone").exists());
        assert!(!dir.path().join(COMMIT_NAME).exists());
        assert!(!dir.path().join(MANIFEST_NAME).exists());
    }

    #[test]
    fn write_then_delete_same_path_collapses_to_delete() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x");

        let mut journal = Journal::new(dir.path());
        journal.stage_write(target.clone(), b"data".to_vec());
        journal.stage_delete(target.clone());
        journal.commit().unwrap();

        assert!(!target.exists());
    }

    #[test]
    fn recover_rolls_back_when_no_commit_record() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x");
        fs::write(shadow_path(&target), b"half-written").unwrap();

        Journal::recover(dir.path()).unwrap();

        assert!(!shadow_path(&target).exists());
        assert!(!target.exists());
    }

    #[test]
    fn recover_replays_when_commit_record_present() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x");

        let mut journal = Journal::new(dir.path());
        journal.stage_write(target.clone(), b"data".to_vec());

        // Simulate a crash between shadow fsync and rotate: stage writes,
        // write the manifest and commit record, but don't rotate.
        Journal::fsync_write(&shadow_path(&target), b"data").unwrap();
        let manifest = journal.encode_manifest();
        Journal::fsync_write(&shadow_path(&journal.manifest_path()), &manifest).unwrap();
        let checksum = crc32fast::hash(&manifest);
        Journal::fsync_write(&journal.commit_path(), &checksum.to_be_bytes()).unwrap();

        Journal::recover(dir.path()).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"data");
        assert!(!dir.path().join(COMMIT_NAME).exists());
    }

    #[test]
    fn recover_rolls_back_on_torn_commit_record() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x");

        let mut journal = Journal::new(dir.path());
        journal.stage_write(target.clone(), b"data".to_vec());

        Journal::fsync_write(&shadow_path(&target), b"data").unwrap();
        let manifest = journal.encode_manifest();
        Journal::fsync_write(&shadow_path(&journal.manifest_path()), &manifest).unwrap();
        // Torn commit record: only 2 of the 4 checksum bytes made it to disk.
        Journal::fsync_write(&journal.commit_path(), &[0u8, 1u8]).unwrap();

        Journal::recover(dir.path()).unwrap();

        assert!(!target.exists());
        assert!(!shadow_path(&target).exists());
        assert!(!dir.path().join(COMMIT_NAME).exists());
    }

    #[test]
    fn recover_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x");
        let mut journal = Journal::new(dir.path());
        journal.stage_write(target.clone(), b"data".to_vec());
        journal.commit().unwrap();

        // Replaying again over an already-clean directory must not error.
        Journal::recover(dir.path()).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"data");
    }
}
