//! System collaborator adapters
//!
//! Thin, replaceable implementations of the capability traits against the
//! host system:
//! - `GitVcs`: changed/uncommitted paths via the `git` CLI
//! - `XcodeBuilder`: drives `xcodebuild` as a cancellable child process
//! - `JsonProject`: project graph persisted as a JSON document (the real
//!   project-file format is handled by an external reader feeding this
//!   shape)

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use super::{
    BuildOutcome, BuildRequest, CancelToken, CollaboratorError, CollaboratorResult, NativeBuilder,
    ProducedArtifact, ProjectReader, ProjectWriter, Vcs,
};
use crate::graph::ProjectGraph;

/// Version control through the `git` CLI.
pub struct GitVcs {
    workdir: PathBuf,
}

impl GitVcs {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn git(&self, args: &[&str]) -> CollaboratorResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|e| CollaboratorError::new("vcs", format!("git: {e}")))?;
        if !output.status.success() {
            return Err(CollaboratorError::new(
                "vcs",
                format!(
                    "git {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Vcs for GitVcs {
    fn changed_files(&self, base_ref: &str) -> CollaboratorResult<Vec<PathBuf>> {
        let out = self.git(&["diff", "--name-only", base_ref])?;
        Ok(out.lines().map(PathBuf::from).collect())
    }

    fn uncommitted_files(&self) -> CollaboratorResult<Vec<PathBuf>> {
        let out = self.git(&["status", "--porcelain"])?;
        Ok(out
            .lines()
            .filter_map(|line| line.get(3..))
            .map(PathBuf::from)
            .collect())
    }
}

/// Drives `xcodebuild` against the workspace.
///
/// The child is polled against the cancel token and terminated on
/// cancellation; the orchestrator then restores the journal.
pub struct XcodeBuilder {
    workspace: PathBuf,
    /// Directory built products are emitted into; one subdirectory per
    /// product after a successful build
    products_dir: PathBuf,
}

impl XcodeBuilder {
    pub fn new(workspace: impl Into<PathBuf>, products_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            products_dir: products_dir.into(),
        }
    }

    fn sdk_name(sdk: crate::flags::Sdk) -> &'static str {
        match sdk {
            crate::flags::Sdk::Sim => "iphonesimulator",
            crate::flags::Sdk::Device => "iphoneos",
        }
    }

    fn collect_products(&self) -> CollaboratorResult<Vec<ProducedArtifact>> {
        let mut produced = Vec::new();
        if !self.products_dir.is_dir() {
            return Ok(produced);
        }
        let entries = std::fs::read_dir(&self.products_dir)
            .map_err(|e| CollaboratorError::new("native builder", e.to_string()))?;
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            // Product directories are named `<product>.framework` or plain
            // `<product>`.
            let name = entry.file_name().to_string_lossy().into_owned();
            let product_name = name
                .strip_suffix(".framework")
                .unwrap_or(&name)
                .to_string();
            produced.push(ProducedArtifact {
                product_name,
                dir,
            });
        }
        Ok(produced)
    }
}

impl NativeBuilder for XcodeBuilder {
    fn build(&self, request: &BuildRequest, cancel: &CancelToken) -> CollaboratorResult<BuildOutcome> {
        let flags = &request.flags;
        let mut cmd = Command::new("xcodebuild");
        cmd.arg("-workspace")
            .arg(&self.workspace)
            .arg("-scheme")
            .arg(&request.target)
            .arg("-configuration")
            .arg(&flags.config)
            .arg("-sdk")
            .arg(Self::sdk_name(flags.sdk))
            .arg(format!("ARCHS={}", flags.arch))
            .arg(format!("SYMROOT={}", self.products_dir.display()));
        if let Some(bundle) = &flags.result_bundle_path {
            cmd.arg("-resultBundlePath").arg(bundle);
        }
        for xcarg in &flags.xcargs {
            cmd.arg(xcarg);
        }
        cmd.arg("build");
        // Output is discarded; the child is polled, so piped streams would
        // deadlock once the pipe buffer fills.
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        debug!(target = %request.target, "spawning xcodebuild");
        let mut child = cmd
            .spawn()
            .map_err(|e| CollaboratorError::new("native builder", format!("xcodebuild: {e}")))?;

        loop {
            if cancel.is_cancelled() {
                warn!("build cancelled, terminating xcodebuild");
                let _ = child.kill();
                let _ = child.wait();
                return Err(CollaboratorError::new("native builder", "cancelled"));
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !status.success() {
                        return Err(CollaboratorError::new(
                            "native builder",
                            format!("xcodebuild exited with {status}"),
                        ));
                    }
                    break;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(200)),
                Err(e) => {
                    return Err(CollaboratorError::new("native builder", e.to_string()));
                }
            }
        }

        Ok(BuildOutcome {
            produced: self.collect_products()?,
        })
    }
}

/// Project graph persisted as a JSON document.
///
/// Parsing the native project-file format is an external concern; this
/// adapter reads and writes the graph in its serialized form.
pub struct JsonProject {
    path: PathBuf,
}

impl JsonProject {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProjectReader for JsonProject {
    fn read(&self) -> CollaboratorResult<ProjectGraph> {
        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            CollaboratorError::new(
                "project reader",
                format!("{}: {e}", self.path.display()),
            )
        })?;
        serde_json::from_str(&json)
            .map_err(|e| CollaboratorError::new("project reader", e.to_string()))
    }
}

impl ProjectWriter for JsonProject {
    fn write(&self, graph: &ProjectGraph) -> CollaboratorResult<()> {
        let json = serde_json::to_string_pretty(graph)
            .map_err(|e| CollaboratorError::new("project writer", e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| {
            CollaboratorError::new(
                "project writer",
                format!("{}: {e}", self.path.display()),
            )
        })
    }
}
