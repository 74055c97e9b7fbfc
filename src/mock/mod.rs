//! In-memory collaborator doubles
//!
//! Configurable implementations of every capability trait, used by unit
//! and integration tests:
//! - `MockProject`: reader/writer pair over an in-memory graph, optionally
//!   mirrored to a disk file so journal behavior is observable
//! - `MockVcs`: scripted changed/uncommitted path lists
//! - `MockBuilder`: records build requests and fabricates artifacts
//! - `FixedToolchains`, `FixedClock`: pinned environment values

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};

use crate::env::{
    BuildOutcome, BuildRequest, CancelToken, Clock, CollaboratorError, CollaboratorResult,
    NativeBuilder, ProducedArtifact, ProjectReader, ProjectWriter, Toolchains, Vcs, XcodeVersion,
};
use crate::graph::ProjectGraph;

/// Reader/writer pair over an in-memory project graph.
///
/// With a disk path configured, every write also serializes the graph to
/// that file and every read prefers the file, so snapshot/restore of the
/// file is visible through the reader exactly as with a real project.
pub struct MockProject {
    state: Mutex<ProjectGraph>,
    disk: Option<PathBuf>,
    saves: AtomicUsize,
    fail_writes: Mutex<Option<String>>,
}

impl MockProject {
    pub fn new(graph: ProjectGraph) -> Self {
        Self {
            state: Mutex::new(graph),
            disk: None,
            saves: AtomicUsize::new(0),
            fail_writes: Mutex::new(None),
        }
    }

    /// Mirror the graph to a disk file on every write.
    pub fn with_disk(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk = Some(path.into());
        self
    }

    /// Make every subsequent write fail with the given message.
    pub fn fail_writes(&self, message: impl Into<String>) {
        *self.fail_writes.lock().unwrap() = Some(message.into());
    }

    /// Number of successful writes so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The current in-memory graph.
    pub fn current(&self) -> ProjectGraph {
        self.state.lock().unwrap().clone()
    }

    /// Read the graph the way the orchestrator sees it (disk mirror
    /// preferred), panicking on failure. Test convenience.
    pub fn read_graph(&self) -> ProjectGraph {
        ProjectReader::read(self).expect("mock project read")
    }

    /// Persist the seed graph to the disk mirror without counting as a
    /// workflow save. Tests call this to lay down the initial file.
    pub fn persist_seed(&self) -> std::io::Result<()> {
        if let Some(path) = &self.disk {
            let graph = self.state.lock().unwrap();
            let json = serde_json::to_string_pretty(&*graph)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json)?;
        }
        Ok(())
    }
}

impl ProjectReader for MockProject {
    fn read(&self) -> CollaboratorResult<ProjectGraph> {
        if let Some(path) = &self.disk {
            if path.is_file() {
                let json = std::fs::read_to_string(path)
                    .map_err(|e| CollaboratorError::new("project reader", e.to_string()))?;
                return serde_json::from_str(&json)
                    .map_err(|e| CollaboratorError::new("project reader", e.to_string()));
            }
        }
        Ok(self.state.lock().unwrap().clone())
    }
}

impl ProjectWriter for MockProject {
    fn write(&self, graph: &ProjectGraph) -> CollaboratorResult<()> {
        if let Some(message) = self.fail_writes.lock().unwrap().clone() {
            return Err(CollaboratorError::new("project writer", message));
        }
        *self.state.lock().unwrap() = graph.clone();
        if let Some(path) = &self.disk {
            let json = serde_json::to_string_pretty(graph)
                .map_err(|e| CollaboratorError::new("project writer", e.to_string()))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CollaboratorError::new("project writer", e.to_string()))?;
            }
            std::fs::write(path, json)
                .map_err(|e| CollaboratorError::new("project writer", e.to_string()))?;
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted version-control answers.
#[derive(Debug, Default)]
pub struct MockVcs {
    pub changed: Vec<PathBuf>,
    pub uncommitted: Vec<PathBuf>,
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_changed(mut self, paths: Vec<PathBuf>) -> Self {
        self.changed = paths;
        self
    }

    pub fn with_uncommitted(mut self, paths: Vec<PathBuf>) -> Self {
        self.uncommitted = paths;
        self
    }
}

impl Vcs for MockVcs {
    fn changed_files(&self, _base_ref: &str) -> CollaboratorResult<Vec<PathBuf>> {
        Ok(self.changed.clone())
    }

    fn uncommitted_files(&self) -> CollaboratorResult<Vec<PathBuf>> {
        Ok(self.uncommitted.clone())
    }
}

/// Records build requests and fabricates one artifact directory per
/// configured product.
pub struct MockBuilder {
    /// Directory fabricated artifacts are written under
    products_dir: PathBuf,
    /// Product names to fabricate on each build
    products: Mutex<Vec<String>>,
    /// Recorded requests
    requests: Mutex<Vec<BuildRequest>>,
    /// Scripted failure
    failure: Mutex<Option<String>>,
}

impl MockBuilder {
    pub fn new(products_dir: impl Into<PathBuf>) -> Self {
        Self {
            products_dir: products_dir.into(),
            products: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn produce(&self, product: impl Into<String>) {
        self.products.lock().unwrap().push(product.into());
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(message.into());
    }

    pub fn requests(&self) -> Vec<BuildRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl NativeBuilder for MockBuilder {
    fn build(&self, request: &BuildRequest, cancel: &CancelToken) -> CollaboratorResult<BuildOutcome> {
        self.requests.lock().unwrap().push(request.clone());

        if cancel.is_cancelled() {
            return Err(CollaboratorError::new("native builder", "cancelled"));
        }
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(CollaboratorError::new("native builder", message));
        }

        let mut produced = Vec::new();
        for product in self.products.lock().unwrap().iter() {
            let dir = self.products_dir.join(product);
            std::fs::create_dir_all(&dir)
                .map_err(|e| CollaboratorError::new("native builder", e.to_string()))?;
            std::fs::write(dir.join(format!("{product}.bin")), product.as_bytes())
                .map_err(|e| CollaboratorError::new("native builder", e.to_string()))?;
            produced.push(ProducedArtifact {
                product_name: product.clone(),
                dir,
            });
        }
        Ok(BuildOutcome { produced })
    }
}

/// Pinned toolchain versions.
#[derive(Debug, Clone)]
pub struct FixedToolchains {
    pub swift: String,
    pub xcode: XcodeVersion,
}

impl Default for FixedToolchains {
    fn default() -> Self {
        Self {
            swift: "Apple Swift version 6.0 (swiftlang-6.0.0.9.10)".to_string(),
            xcode: XcodeVersion {
                base: "16.2".to_string(),
                build: "16C5032a".to_string(),
            },
        }
    }
}

impl Toolchains for FixedToolchains {
    fn swift_version(&self) -> CollaboratorResult<String> {
        Ok(self.swift.clone())
    }

    fn xcode_version(&self) -> CollaboratorResult<XcodeVersion> {
        Ok(self.xcode.clone())
    }
}

/// A clock pinned to one instant.
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

impl Default for FixedClock {
    fn default() -> Self {
        Self(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
