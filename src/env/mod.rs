//! Collaborator capability traits
//!
//! Every external dependency of the core sits behind a small trait with a
//! system adapter here and an in-memory double in `crate::mock`:
//! - `ProjectReader` / `ProjectWriter`: project load and persistence
//! - `Vcs`: changed/uncommitted paths only
//! - `NativeBuilder`: drives the platform build tool
//! - `Toolchains`: compiler and IDE version strings
//! - `Clock`: wall-clock reads
//!
//! Environment variables are read exactly once at startup into an
//! immutable `Environment` value.

mod adapters;

pub use adapters::{GitVcs, JsonProject, XcodeBuilder};

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flags::BuildFlags;
use crate::graph::ProjectGraph;

/// Error from any external collaborator. Bubbles unchanged to the
/// orchestrator, which recovers the journal and surfaces it.
#[derive(Debug, thiserror::Error)]
#[error("collaborator failure in {component}: {message}")]
pub struct CollaboratorError {
    /// Which collaborator failed
    pub component: &'static str,
    /// Failure description
    pub message: String,
}

impl CollaboratorError {
    pub fn new(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            component,
            message: message.into(),
        }
    }
}

/// Result type for collaborator calls
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Loads the project graph from disk.
pub trait ProjectReader: Send + Sync {
    fn read(&self) -> CollaboratorResult<ProjectGraph>;
}

/// Persists a mutated project graph.
pub trait ProjectWriter: Send + Sync {
    fn write(&self, graph: &ProjectGraph) -> CollaboratorResult<()>;
}

/// Version-control inspection, limited to changed-path queries.
pub trait Vcs: Send + Sync {
    /// Paths changed since the given commit reference.
    fn changed_files(&self, base_ref: &str) -> CollaboratorResult<Vec<PathBuf>>;

    /// Paths with uncommitted modifications.
    fn uncommitted_files(&self) -> CollaboratorResult<Vec<PathBuf>>;

    /// Whether the working tree has uncommitted modifications.
    fn is_dirty(&self) -> CollaboratorResult<bool> {
        Ok(!self.uncommitted_files()?.is_empty())
    }
}

/// A request handed to the native build tool.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Name of the target to build (typically the synthetic aggregate)
    pub target: String,
    /// Build parameters
    pub flags: BuildFlags,
}

/// One artifact directory produced by a native build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArtifact {
    /// Product name the directory belongs to
    pub product_name: String,
    /// Directory holding the built product
    pub dir: PathBuf,
}

/// Outcome of a successful native build.
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    /// Artifact directories, one per built product
    pub produced: Vec<ProducedArtifact>,
}

/// Cooperative cancellation flag shared with the native builder.
///
/// The orchestrator trips it on signal; the builder terminates its child
/// process and returns.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Drives the platform native build tool.
pub trait NativeBuilder: Send + Sync {
    fn build(&self, request: &BuildRequest, cancel: &CancelToken) -> CollaboratorResult<BuildOutcome>;
}

/// IDE toolchain version, base plus build identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XcodeVersion {
    /// Marketing version (e.g. "16.2")
    pub base: String,
    /// Build identifier (e.g. "16C5032a")
    pub build: String,
}

/// Toolchain version strings folded into every fingerprint.
pub trait Toolchains: Send + Sync {
    fn swift_version(&self) -> CollaboratorResult<String>;
    fn xcode_version(&self) -> CollaboratorResult<XcodeVersion>;
}

/// Wall-clock reads, behind a trait so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Host toolchain adapter; shells out to the installed tools.
#[derive(Debug, Clone, Default)]
pub struct HostToolchains;

impl HostToolchains {
    fn run(cmd: &str, args: &[&str]) -> CollaboratorResult<String> {
        let output = Command::new(cmd)
            .args(args)
            .output()
            .map_err(|e| CollaboratorError::new("toolchains", format!("{cmd}: {e}")))?;
        if !output.status.success() {
            return Err(CollaboratorError::new(
                "toolchains",
                format!("{cmd} exited with {}", output.status),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Toolchains for HostToolchains {
    fn swift_version(&self) -> CollaboratorResult<String> {
        // First line of `swift --version`, e.g.
        // "swift-driver version: 1.115 Apple Swift version 6.0 ..."
        let out = Self::run("swift", &["--version"])?;
        Ok(out.lines().next().unwrap_or_default().trim().to_string())
    }

    fn xcode_version(&self) -> CollaboratorResult<XcodeVersion> {
        // `xcodebuild -version` prints:
        //   Xcode 16.2
        //   Build version 16C5032a
        let out = Self::run("xcodebuild", &["-version"])?;
        let mut base = String::new();
        let mut build = String::new();
        for line in out.lines() {
            if let Some(v) = line.strip_prefix("Xcode ") {
                base = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("Build version ") {
                build = v.trim().to_string();
            }
        }
        if base.is_empty() {
            return Err(CollaboratorError::new("toolchains", "could not parse xcodebuild -version"));
        }
        Ok(XcodeVersion { base, build })
    }
}

/// Debug switches, immutable after startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugOptions {
    /// Emit detailed request-signing traces
    pub s3_trace: bool,
}

/// Remote object-store settings read from the environment.
#[derive(Debug, Clone, Default)]
pub struct RemoteSettings {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// Snapshot of every environment variable the core reads, taken once at
/// startup.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub remote: RemoteSettings,
    pub debug: DebugOptions,
}

impl Environment {
    /// Capture the process environment.
    pub fn capture() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            remote: RemoteSettings {
                endpoint: var("S3_ENDPOINT"),
                bucket: var("S3_BUCKET"),
                access_key: var("S3_ACCESS_KEY"),
                secret_key: var("S3_SECRET_KEY"),
            },
            debug: DebugOptions {
                s3_trace: var("RUGBY_DEBUG_S3").is_some(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_trips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());

        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_collaborator_error_display() {
        let err = CollaboratorError::new("vcs", "exit code 128");
        assert_eq!(err.to_string(), "collaborator failure in vcs: exit code 128");
    }

    #[test]
    fn test_system_clock_monotone_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
