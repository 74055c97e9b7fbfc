//! The `+latest` pointer registry
//!
//! One flat text file at the store root naming the most recent entry per
//! `(product, config-sdk-arch)` group, one absolute path per line with a
//! trailing newline. Rewrites go through a sibling temp file and rename,
//! so readers always see a complete file. The previous file is kept as a
//! timestamped backup first.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{BinaryStore, ScannedEntry, StoreError, StoreResult};

/// Name of the pointer file at the store root.
pub const LATEST_FILE: &str = "+latest";

/// One parsed line of the pointer file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestPointer {
    /// Absolute path of the entry directory
    pub path: PathBuf,
    /// Product directory name
    pub product: String,
    /// `<config>-<sdk>-<arch>` group directory name
    pub group: String,
    /// Entry fingerprint
    pub fingerprint: String,
}

impl BinaryStore {
    fn latest_path(&self) -> PathBuf {
        self.root().join(LATEST_FILE)
    }

    /// Rescan the store and rewrite `+latest`.
    ///
    /// Groups every entry by `(product, group)`, keeps the newest by
    /// modification time, and writes the selected absolute paths sorted by
    /// group. Returns the number of pointers written.
    pub fn refresh_latest(&self) -> StoreResult<usize> {
        let _lock = self.take_lock()?;

        let entries = self.scan_entries()?;

        // (product, group) -> newest entry
        let mut newest: BTreeMap<(String, String), ScannedEntry> = BTreeMap::new();
        for entry in entries {
            let key = (entry.product.clone(), entry.group.clone());
            match newest.get(&key) {
                Some(current) if current.modified >= entry.modified => {}
                _ => {
                    newest.insert(key, entry);
                }
            }
        }

        let mut body = String::new();
        for entry in newest.values() {
            body.push_str(&entry.path.to_string_lossy());
            body.push('\n');
        }

        let latest = self.latest_path();
        self.backup_existing(&latest);

        let temp = self.root().join(format!(".{LATEST_FILE}.tmp"));
        fs::write(&temp, body.as_bytes()).map_err(|e| StoreError::Io {
            operation: "write latest temp",
            path: temp.clone(),
            source: e,
        })?;
        fs::rename(&temp, &latest).map_err(|e| StoreError::Io {
            operation: "publish latest",
            path: latest,
            source: e,
        })?;

        Ok(newest.len())
    }

    /// Copy the current `+latest` aside before a rewrite. Failure to back
    /// up is logged and does not block the rewrite.
    fn backup_existing(&self, latest: &Path) {
        if !latest.is_file() {
            return;
        }
        let micros = self.now().timestamp_micros();
        let mut backup = self.root().join(format!("{LATEST_FILE}.backup.{micros}"));
        if backup.exists() {
            backup = self.root().join(format!(
                "{LATEST_FILE}.backup.{micros}.{}",
                ulid::Ulid::new().to_string().to_lowercase()
            ));
        }
        if let Err(e) = fs::copy(latest, &backup) {
            warn!(path = %backup.display(), error = %e, "failed to back up +latest");
        }
    }

    /// Read and parse `+latest`. Fails with `NoLatestFile` when absent.
    pub fn read_latest(&self) -> StoreResult<Vec<LatestPointer>> {
        let latest = self.latest_path();
        if !latest.is_file() {
            return Err(StoreError::NoLatestFile(self.root().to_path_buf()));
        }
        let body = fs::read_to_string(&latest).map_err(|e| StoreError::Io {
            operation: "read latest",
            path: latest,
            source: e,
        })?;

        let mut pointers = Vec::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let path = PathBuf::from(line);
            let mut tail: Vec<String> = path
                .components()
                .rev()
                .take(3)
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            if tail.len() != 3 {
                continue;
            }
            let fingerprint = tail.remove(0);
            let group = tail.remove(0);
            let product = tail.remove(0);
            pointers.push(LatestPointer {
                path,
                product,
                group,
                fingerprint,
            });
        }
        Ok(pointers)
    }
}
