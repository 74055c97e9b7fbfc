//! Project backup journal
//!
//! Two named slots under `<rugby-root>/backup/`:
//! - `original`: taken lazily on the first mutation of a clean project and
//!   kept until an explicit rollback
//! - `tmp`: taken at the start of every mutating workflow, discarded on
//!   clean exit, restored on failure or signal
//!
//! A slot is a plain directory tree mirroring the snapshotted files with
//! relative paths preserved, so a restore is a byte-exact copy back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

/// Result type for journal operations
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors from journal operations
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("no snapshot in slot {0}")]
    NoSnapshot(JournalSlot),

    #[error("snapshot source is outside the workspace: {0}")]
    OutsideWorkspace(PathBuf),

    #[error("{operation} failed at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(operation: &'static str, path: &Path, source: io::Error) -> JournalError {
    JournalError::Io {
        operation,
        path: path.to_path_buf(),
        source,
    }
}

/// Snapshot slot name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalSlot {
    Original,
    Tmp,
}

impl JournalSlot {
    pub fn dir_name(&self) -> &'static str {
        match self {
            JournalSlot::Original => "original",
            JournalSlot::Tmp => "tmp",
        }
    }
}

impl std::fmt::Display for JournalSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// The backup journal. Owns both slot directories.
pub struct BackupJournal {
    /// Journal root, `<rugby-root>/backup`
    root: PathBuf,
    /// Workspace root the snapshotted relative paths resolve against
    workspace: PathBuf,
}

impl BackupJournal {
    pub fn new(root: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            workspace: workspace.into(),
        }
    }

    fn slot_dir(&self, slot: JournalSlot) -> PathBuf {
        self.root.join(slot.dir_name())
    }

    /// Whether the slot holds a snapshot.
    pub fn exists(&self, slot: JournalSlot) -> bool {
        self.slot_dir(slot).is_dir()
    }

    /// Snapshot the given workspace-relative files into the slot,
    /// replacing any previous snapshot.
    pub fn snapshot(&self, slot: JournalSlot, files: &[PathBuf]) -> JournalResult<()> {
        let slot_dir = self.slot_dir(slot);
        if slot_dir.exists() {
            fs::remove_dir_all(&slot_dir).map_err(|e| io_err("clear slot", &slot_dir, e))?;
        }
        fs::create_dir_all(&slot_dir).map_err(|e| io_err("create slot", &slot_dir, e))?;

        for relative in files {
            if relative.is_absolute() || relative.components().any(|c| {
                matches!(c, std::path::Component::ParentDir)
            }) {
                return Err(JournalError::OutsideWorkspace(relative.clone()));
            }
            let source = self.workspace.join(relative);
            if !source.exists() {
                continue;
            }
            let dest = slot_dir.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err("create slot subdir", parent, e))?;
            }
            fs::copy(&source, &dest).map_err(|e| io_err("snapshot file", &source, e))?;
        }
        Ok(())
    }

    /// Restore every file in the slot back to the workspace.
    pub fn restore(&self, slot: JournalSlot) -> JournalResult<()> {
        let slot_dir = self.slot_dir(slot);
        if !slot_dir.is_dir() {
            return Err(JournalError::NoSnapshot(slot));
        }

        for entry in WalkDir::new(&slot_dir).follow_links(false) {
            let entry = entry.map_err(|e| JournalError::Io {
                operation: "walk slot",
                path: slot_dir.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&slot_dir)
                .expect("walk stays under the slot");
            let dest = self.workspace.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err("create workspace subdir", parent, e))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| io_err("restore file", entry.path(), e))?;
        }
        Ok(())
    }

    /// Delete the slot. Missing slots are fine.
    pub fn discard(&self, slot: JournalSlot) -> JournalResult<()> {
        let slot_dir = self.slot_dir(slot);
        if slot_dir.exists() {
            fs::remove_dir_all(&slot_dir).map_err(|e| io_err("discard slot", &slot_dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BackupJournal) {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().join("workspace");
        fs::create_dir_all(workspace.join("Pods")).unwrap();
        fs::write(workspace.join("Pods/project.pbxproj"), b"original-project").unwrap();
        fs::write(workspace.join("Podfile.lock"), b"original-lock").unwrap();
        let journal = BackupJournal::new(temp.path().join("backup"), &workspace);
        (temp, journal)
    }

    fn project_files() -> Vec<PathBuf> {
        vec![
            PathBuf::from("Pods/project.pbxproj"),
            PathBuf::from("Podfile.lock"),
        ]
    }

    #[test]
    fn test_snapshot_then_restore_round_trip() {
        let (temp, journal) = setup();
        let workspace = temp.path().join("workspace");

        journal.snapshot(JournalSlot::Tmp, &project_files()).unwrap();

        // Mutate both files, then restore.
        fs::write(workspace.join("Pods/project.pbxproj"), b"mutated").unwrap();
        fs::write(workspace.join("Podfile.lock"), b"mutated-too").unwrap();
        journal.restore(JournalSlot::Tmp).unwrap();

        assert_eq!(
            fs::read(workspace.join("Pods/project.pbxproj")).unwrap(),
            b"original-project"
        );
        assert_eq!(
            fs::read(workspace.join("Podfile.lock")).unwrap(),
            b"original-lock"
        );
    }

    #[test]
    fn test_restore_missing_slot_fails() {
        let (_temp, journal) = setup();
        let result = journal.restore(JournalSlot::Original);
        assert!(matches!(result, Err(JournalError::NoSnapshot(JournalSlot::Original))));
    }

    #[test]
    fn test_exists_and_discard() {
        let (_temp, journal) = setup();
        assert!(!journal.exists(JournalSlot::Tmp));

        journal.snapshot(JournalSlot::Tmp, &project_files()).unwrap();
        assert!(journal.exists(JournalSlot::Tmp));

        journal.discard(JournalSlot::Tmp).unwrap();
        assert!(!journal.exists(JournalSlot::Tmp));

        // Discarding again is fine.
        journal.discard(JournalSlot::Tmp).unwrap();
    }

    #[test]
    fn test_snapshot_overwrites_previous() {
        let (temp, journal) = setup();
        let workspace = temp.path().join("workspace");

        journal.snapshot(JournalSlot::Tmp, &project_files()).unwrap();
        fs::write(workspace.join("Podfile.lock"), b"second-state").unwrap();
        journal.snapshot(JournalSlot::Tmp, &project_files()).unwrap();

        fs::write(workspace.join("Podfile.lock"), b"third-state").unwrap();
        journal.restore(JournalSlot::Tmp).unwrap();
        assert_eq!(fs::read(workspace.join("Podfile.lock")).unwrap(), b"second-state");
    }

    #[test]
    fn test_snapshot_skips_missing_files() {
        let (_temp, journal) = setup();
        let mut files = project_files();
        files.push(PathBuf::from("DoesNotExist.xcconfig"));
        journal.snapshot(JournalSlot::Tmp, &files).unwrap();
        journal.restore(JournalSlot::Tmp).unwrap();
    }

    #[test]
    fn test_snapshot_rejects_escaping_paths() {
        let (_temp, journal) = setup();
        let result = journal.snapshot(JournalSlot::Tmp, &[PathBuf::from("../outside")]);
        assert!(matches!(result, Err(JournalError::OutsideWorkspace(_))));
    }

    #[test]
    fn test_slots_are_independent() {
        let (temp, journal) = setup();
        let workspace = temp.path().join("workspace");

        journal.snapshot(JournalSlot::Original, &project_files()).unwrap();
        fs::write(workspace.join("Podfile.lock"), b"tmp-era").unwrap();
        journal.snapshot(JournalSlot::Tmp, &project_files()).unwrap();

        fs::write(workspace.join("Podfile.lock"), b"latest").unwrap();

        journal.restore(JournalSlot::Tmp).unwrap();
        assert_eq!(fs::read(workspace.join("Podfile.lock")).unwrap(), b"tmp-era");

        journal.restore(JournalSlot::Original).unwrap();
        assert_eq!(fs::read(workspace.join("Podfile.lock")).unwrap(), b"original-lock");
    }
}
