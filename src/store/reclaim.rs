//! Storage usage accounting and reclamation
//!
//! Usage is an advisory signal: reclamation failures log and continue, and
//! the store never refuses an import for being over the limit. Eviction is
//! least-recently-used, by access time where the filesystem records one and
//! by creation time otherwise. Entries referenced by the current run's
//! plan are never deleted.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{dir_size, BinaryStore, EntryMetadata, StoreResult, METADATA_FILE};

/// Once reclamation triggers, it frees space down to `limit` minus this.
pub const RECLAIM_HYSTERESIS: f64 = 0.1;

/// Store usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreUsage {
    /// Bytes used by the store
    pub used_bytes: u64,
    /// Capacity of the volume hosting the store
    pub total_bytes: u64,
    /// `used_bytes / total_bytes`
    pub fraction_used: f64,
}

/// Outcome of one reclamation pass.
#[derive(Debug, Clone, Default)]
pub struct ReclaimResult {
    /// Entries scanned
    pub scanned: usize,
    /// Entries deleted
    pub deleted: usize,
    /// Bytes freed
    pub freed_bytes: u64,
    /// Entries protected by the current plan
    pub protected: usize,
    /// Non-fatal per-entry failures
    pub errors: Vec<String>,
}

#[derive(Debug)]
struct EvictionCandidate {
    path: std::path::PathBuf,
    fingerprint: String,
    size_bytes: u64,
    last_used: SystemTime,
}

impl BinaryStore {
    /// Compute current usage for the volume hosting the store.
    pub fn usage(&self) -> StoreResult<StoreUsage> {
        let used_bytes = if self.root().is_dir() {
            dir_size(self.root()).unwrap_or(0)
        } else {
            0
        };
        let total_bytes = volume_total(self.root());
        let fraction_used = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64
        };
        Ok(StoreUsage {
            used_bytes,
            total_bytes,
            fraction_used,
        })
    }

    /// Delete least-recently-used entries until usage drops strictly below
    /// `limit - RECLAIM_HYSTERESIS`. No-op while usage is below `limit`.
    ///
    /// `protected` names fingerprints the current run still needs.
    pub fn reclaim(&self, limit: f64, protected: &HashSet<String>) -> StoreResult<ReclaimResult> {
        let mut result = ReclaimResult::default();

        let usage = self.usage()?;
        if usage.fraction_used < limit {
            return Ok(result);
        }
        let floor = (limit - RECLAIM_HYSTERESIS).max(0.0);

        let _lock = self.take_lock()?;

        let mut candidates: Vec<EvictionCandidate> = Vec::new();
        for scanned in self.scan_entries()? {
            result.scanned += 1;
            if protected.contains(&scanned.fingerprint) {
                result.protected += 1;
                continue;
            }
            let size_bytes = dir_size(&scanned.path).unwrap_or(0);
            let last_used = entry_last_used(&scanned.path).unwrap_or(scanned.modified);
            candidates.push(EvictionCandidate {
                path: scanned.path,
                fingerprint: scanned.fingerprint,
                size_bytes,
                last_used,
            });
        }

        // Oldest first.
        candidates.sort_by_key(|c| c.last_used);

        let total = usage.total_bytes.max(1);
        let mut used = usage.used_bytes;

        for candidate in candidates {
            if (used as f64 / total as f64) < floor {
                break;
            }
            match fs::remove_dir_all(&candidate.path) {
                Ok(()) => {
                    info!(
                        fingerprint = %candidate.fingerprint,
                        freed = candidate.size_bytes,
                        "evicted cache entry"
                    );
                    result.deleted += 1;
                    result.freed_bytes += candidate.size_bytes;
                    used = used.saturating_sub(candidate.size_bytes);
                }
                Err(e) => {
                    warn!(path = %candidate.path.display(), error = %e, "eviction failed");
                    result
                        .errors
                        .push(format!("{}: {}", candidate.path.display(), e));
                }
            }
        }

        Ok(result)
    }
}

/// Best-available "last used" time for an entry: the directory's access
/// time when the filesystem records one, else the metadata creation time.
fn entry_last_used(path: &Path) -> Option<SystemTime> {
    if let Ok(meta) = fs::metadata(path) {
        if let Ok(atime) = meta.accessed() {
            return Some(atime);
        }
    }
    let json = fs::read_to_string(path.join(METADATA_FILE)).ok()?;
    let metadata: EntryMetadata = serde_json::from_str(&json).ok()?;
    let created: DateTime<Utc> = metadata.created_at;
    Some(SystemTime::from(created))
}

fn volume_total(path: &Path) -> u64 {
    // Walk up to the nearest existing ancestor; a fresh store root may not
    // exist yet.
    let mut probe = path;
    loop {
        if probe.exists() {
            return fs2::total_space(probe).unwrap_or(0);
        }
        match probe.parent() {
            Some(parent) => probe = parent,
            None => return 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::BuildFlags;
    use crate::graph::{Target, TargetKind};
    use tempfile::TempDir;

    fn import_entry(store: &BinaryStore, temp: &TempDir, product: &str, fingerprint: &str) {
        let source = temp.path().join("src").join(fingerprint);
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("lib.a"), vec![0u8; 1024]).unwrap();

        let mut target = Target::new(product, product, TargetKind::Framework);
        target.fingerprint = Some(fingerprint.to_string());
        store.import(&target, &BuildFlags::default(), &source).unwrap();
    }

    #[test]
    fn test_usage_counts_bytes() {
        let temp = TempDir::new().unwrap();
        let store = BinaryStore::new(temp.path().join("bin"));
        import_entry(&store, &temp, "Alpha", "aa11");

        let usage = store.usage().unwrap();
        assert!(usage.used_bytes >= 1024);
        assert!(usage.total_bytes > 0);
        assert!(usage.fraction_used > 0.0);
    }

    #[test]
    fn test_usage_on_missing_root() {
        let temp = TempDir::new().unwrap();
        let store = BinaryStore::new(temp.path().join("never-created"));
        let usage = store.usage().unwrap();
        assert_eq!(usage.used_bytes, 0);
    }

    #[test]
    fn test_reclaim_noop_below_limit() {
        let temp = TempDir::new().unwrap();
        let store = BinaryStore::new(temp.path().join("bin"));
        import_entry(&store, &temp, "Alpha", "aa11");

        // A temp dir cannot plausibly fill the volume.
        let result = store.reclaim(0.99, &HashSet::new()).unwrap();
        assert_eq!(result.deleted, 0);
        assert!(store.scan_entries().unwrap().len() == 1);
    }

    #[test]
    fn test_reclaim_evicts_lru_first() {
        let temp = TempDir::new().unwrap();
        let store = BinaryStore::new(temp.path().join("bin"));
        import_entry(&store, &temp, "Alpha", "aa11");
        std::thread::sleep(std::time::Duration::from_millis(20));
        import_entry(&store, &temp, "Beta", "bb22");

        // limit 0.0 forces eviction of everything unprotected
        let result = store.reclaim(0.0, &HashSet::new()).unwrap();
        assert_eq!(result.scanned, 2);
        assert!(result.deleted >= 1);
        assert!(result.freed_bytes > 0);
    }

    #[test]
    fn test_reclaim_never_touches_protected() {
        let temp = TempDir::new().unwrap();
        let store = BinaryStore::new(temp.path().join("bin"));
        import_entry(&store, &temp, "Alpha", "aa11");
        import_entry(&store, &temp, "Beta", "bb22");

        let protected: HashSet<String> = ["aa11".to_string()].into();
        let result = store.reclaim(0.0, &protected).unwrap();
        assert_eq!(result.protected, 1);

        let remaining = store.scan_entries().unwrap();
        assert!(remaining.iter().any(|e| e.fingerprint == "aa11"));
        assert!(result.deleted >= 1 || remaining.len() == 2);
    }
}
