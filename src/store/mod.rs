//! Content-addressed binary store
//!
//! Layout under the store root (`<rugby-root>/bin`):
//!
//! ```text
//! bin/
//!   <product-name>/
//!     <config>-<sdk>-<arch>/
//!       <fingerprint>/
//!         <artifact files and metadata.json>
//!   +latest
//! ```
//!
//! The depth from the root to a fingerprint directory is exactly three and
//! leaf names are lowercase hex; scans rely on both. Mutations stage into
//! a sibling temp directory and rename into place, so concurrent readers
//! never observe a partial entry.

mod latest;
mod reclaim;

pub use latest::{LATEST_FILE, LatestPointer};
pub use reclaim::{StoreUsage, ReclaimResult, RECLAIM_HYSTERESIS};

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::env::{Clock, SystemClock};
use crate::flags::BuildFlags;
use crate::graph::Target;

/// Sidecar file written into every cache entry.
pub const METADATA_FILE: &str = "metadata.json";

/// Advisory lock file at the store root. Taken by mutating operations;
/// readers never block on it.
pub const LOCK_FILE: &str = ".lock";

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} failed at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("target {0} has no fingerprint")]
    MissingFingerprint(String),

    #[error("no +latest file under {0}")]
    NoLatestFile(PathBuf),

    #[error("store lock timeout after {0:?}")]
    LockTimeout(Duration),

    #[error("metadata error at {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(operation: &'static str, path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        operation,
        path: path.to_path_buf(),
        source,
    }
}

/// `metadata.json` contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Fingerprint the entry is keyed by
    pub fingerprint: String,
    /// Product name
    pub product: String,
    /// Build configuration
    pub config: String,
    /// SDK family
    pub sdk: String,
    /// CPU architecture
    pub arch: String,
    /// Creation time, ISO-8601
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// One entry in the local store.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Absolute path of the entry directory
    pub path: PathBuf,
    /// Sidecar metadata
    pub metadata: EntryMetadata,
    /// Total size of the entry in bytes
    pub size_bytes: u64,
}

impl CacheEntry {
    /// The store-relative key of this entry, `<product>/<group>/<fingerprint>`.
    pub fn relative_key(&self) -> String {
        format!(
            "{}/{}-{}-{}/{}",
            self.metadata.product,
            self.metadata.config,
            self.metadata.sdk,
            self.metadata.arch,
            self.metadata.fingerprint
        )
    }
}

/// An entry found by a store scan, before its metadata is read.
#[derive(Debug, Clone)]
pub(crate) struct ScannedEntry {
    pub path: PathBuf,
    pub product: String,
    pub group: String,
    pub fingerprint: String,
    pub modified: SystemTime,
}

/// Held advisory lock on the store root.
pub struct StoreLock {
    #[allow(dead_code)]
    file: File,
}

impl StoreLock {
    /// Acquire the store lock, waiting up to `timeout`.
    fn acquire(root: &Path, timeout: Duration) -> StoreResult<Self> {
        fs::create_dir_all(root).map_err(|e| io_err("create store root", root, e))?;
        let lock_path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_err("open lock file", &lock_path, e))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return Err(StoreError::LockTimeout(timeout)),
            }
        }
    }
}

/// The local binary store.
pub struct BinaryStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl BinaryStore {
    /// Open a store rooted at the given directory (created lazily).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock: Arc::new(SystemClock),
            lock_timeout: Duration::from_secs(30),
        }
    }

    /// Replace the clock (tests pin time through this).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn take_lock(&self) -> StoreResult<StoreLock> {
        StoreLock::acquire(&self.root, self.lock_timeout)
    }

    /// Directory an entry for `(target, flags)` lives in.
    pub fn entry_dir(&self, target: &Target, flags: &BuildFlags) -> StoreResult<PathBuf> {
        let fingerprint = target
            .fingerprint
            .as_deref()
            .ok_or_else(|| StoreError::MissingFingerprint(target.name.clone()))?;
        Ok(self
            .root
            .join(target.product_name())
            .join(flags.group_dir())
            .join(fingerprint))
    }

    /// Look up the cache entry matching a fingerprinted target.
    ///
    /// A present directory with missing or unparsable `metadata.json` is a
    /// corrupt entry: it is removed and reported as a miss.
    pub fn lookup(&self, target: &Target, flags: &BuildFlags) -> StoreResult<Option<CacheEntry>> {
        let dir = self.entry_dir(target, flags)?;
        if !dir.is_dir() {
            return Ok(None);
        }

        let metadata_path = dir.join(METADATA_FILE);
        let metadata = match fs::read_to_string(&metadata_path) {
            Ok(json) => match serde_json::from_str::<EntryMetadata>(&json) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "corrupt cache entry, removing");
                    let _ = fs::remove_dir_all(&dir);
                    return Ok(None);
                }
            },
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "cache entry without metadata, removing");
                let _ = fs::remove_dir_all(&dir);
                return Ok(None);
            }
        };

        Ok(Some(CacheEntry {
            size_bytes: dir_size(&dir).unwrap_or(0),
            path: dir,
            metadata,
        }))
    }

    /// Import produced artifacts for a fingerprinted target.
    ///
    /// Stages into a sibling temp directory and renames into place; readers
    /// see either nothing or the complete entry. Importing a key that
    /// already exists keeps the existing entry.
    pub fn import(
        &self,
        target: &Target,
        flags: &BuildFlags,
        source: &Path,
    ) -> StoreResult<CacheEntry> {
        let _lock = self.take_lock()?;

        let final_dir = self.entry_dir(target, flags)?;
        if final_dir.is_dir() {
            if let Some(existing) = self.lookup(target, flags)? {
                return Ok(existing);
            }
        }

        let fingerprint = target
            .fingerprint
            .clone()
            .ok_or_else(|| StoreError::MissingFingerprint(target.name.clone()))?;

        let group_dir = final_dir
            .parent()
            .expect("entry dir always has a group parent")
            .to_path_buf();
        fs::create_dir_all(&group_dir).map_err(|e| io_err("create group dir", &group_dir, e))?;

        // Stage alongside the destination so the final rename stays on one
        // filesystem.
        let stage = group_dir.join(format!(
            ".import-{}-{}",
            &fingerprint[..fingerprint.len().min(12)],
            ulid::Ulid::new().to_string().to_lowercase()
        ));
        copy_dir(source, &stage)?;

        let metadata = EntryMetadata {
            fingerprint,
            product: target.product_name().to_string(),
            config: flags.config.clone(),
            sdk: flags.sdk.to_string(),
            arch: flags.arch.to_string(),
            created_at: self.now(),
        };
        let metadata_path = stage.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&metadata).map_err(|source| StoreError::Metadata {
            path: metadata_path.clone(),
            source,
        })?;
        fs::write(&metadata_path, json).map_err(|e| io_err("write metadata", &metadata_path, e))?;

        match fs::rename(&stage, &final_dir) {
            Ok(()) => {}
            Err(e) => {
                let _ = fs::remove_dir_all(&stage);
                // Lost a race against a concurrent import of the same key.
                if final_dir.is_dir() {
                    if let Some(existing) = self.lookup(target, flags)? {
                        return Ok(existing);
                    }
                }
                return Err(io_err("publish entry", &final_dir, e));
            }
        }

        Ok(CacheEntry {
            size_bytes: dir_size(&final_dir).unwrap_or(0),
            path: final_dir,
            metadata,
        })
    }

    /// Walk the store and yield every well-formed entry directory.
    ///
    /// Only directories exactly three levels deep whose leaf name is
    /// lowercase hex qualify; anything else is ignored.
    pub(crate) fn scan_entries(&self) -> StoreResult<Vec<ScannedEntry>> {
        let mut entries = Vec::new();
        if !self.root.is_dir() {
            return Ok(entries);
        }

        let products =
            fs::read_dir(&self.root).map_err(|e| io_err("read store root", &self.root, e))?;
        for product in products.flatten() {
            if !product.path().is_dir() {
                continue;
            }
            let product_name = product.file_name().to_string_lossy().into_owned();

            let groups = match fs::read_dir(product.path()) {
                Ok(g) => g,
                Err(_) => continue,
            };
            for group in groups.flatten() {
                if !group.path().is_dir() {
                    continue;
                }
                let group_name = group.file_name().to_string_lossy().into_owned();

                let leaves = match fs::read_dir(group.path()) {
                    Ok(l) => l,
                    Err(_) => continue,
                };
                for leaf in leaves.flatten() {
                    let path = leaf.path();
                    if !path.is_dir() {
                        continue;
                    }
                    let name = leaf.file_name().to_string_lossy().into_owned();
                    if name.is_empty() || !name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
                        continue;
                    }
                    let modified = leaf
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    entries.push(ScannedEntry {
                        path,
                        product: product_name.clone(),
                        group: group_name.clone(),
                        fingerprint: name,
                        modified,
                    });
                }
            }
        }

        Ok(entries)
    }
}

/// Recursively copy a directory tree.
fn copy_dir(from: &Path, to: &Path) -> StoreResult<()> {
    fs::create_dir_all(to).map_err(|e| io_err("create dir", to, e))?;
    let entries = fs::read_dir(from).map_err(|e| io_err("read dir", from, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err("read dir entry", from, e))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| io_err("stat", &src, e))?;
        if file_type.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            fs::copy(&src, &dst).map_err(|e| io_err("copy file", &src, e))?;
        }
    }
    Ok(())
}

/// Total size of every file under a directory.
pub(crate) fn dir_size(path: &Path) -> io::Result<u64> {
    let mut size = 0;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let child = entry.path();
            if child.is_dir() {
                size += dir_size(&child)?;
            } else {
                size += entry.metadata()?.len();
            }
        }
    }
    Ok(size)
}
