//! C12: lazy write-behind for ACL/region/prefs with a coalescing debounce
//! timer and an atomic write-temp-then-rename flush.

use crate::error::CoreError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistKind {
    Acl,
    Region,
    Prefs,
}

/// Atomically replaces the contents of `path`: writes to a sibling temp file
/// then renames over the destination. `rename` within one filesystem is
/// atomic on the platforms this targets.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let tmp_path = tmp_path_for(path);
    std::fs::write(&tmp_path, bytes).map_err(|e| CoreError::PersistenceFailure(format!("write {}: {e}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, path).map_err(|e| CoreError::PersistenceFailure(format!("rename onto {}: {e}", path.display())))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

pub struct Persistence {
    coalesce_window_ms: u64,
    /// Kind -> deadline (ms) at which it should be flushed. A fresh
    /// `mark_dirty` extends the deadline, coalescing bursts of writes.
    deadlines: HashMap<PersistKind, u64>,
}

impl Persistence {
    pub fn new(coalesce_window_ms: u64) -> Self {
        Self { coalesce_window_ms, deadlines: HashMap::new() }
    }

    pub fn mark_dirty(&mut self, kind: PersistKind, now_ms: u64) {
        self.deadlines.insert(kind, now_ms + self.coalesce_window_ms);
    }

    /// Kinds whose coalescing timer has expired as of `now_ms`.
    pub fn due(&self, now_ms: u64) -> Vec<PersistKind> {
        self.deadlines.iter().filter(|(_, &deadline)| now_ms >= deadline).map(|(k, _)| *k).collect()
    }

    /// Call after a successful flush. On failure (§7 PersistenceFailure),
    /// the caller should leave the dirty flag set so the next coalescing
    /// tick retries — i.e. simply not call this.
    pub fn clear(&mut self, kind: PersistKind) {
        self.deadlines.remove(&kind);
    }

    pub fn is_dirty(&self, kind: PersistKind) -> bool {
        self.deadlines.contains_key(&kind)
    }
}
