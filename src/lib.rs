//! Rugby - binary cache for Xcode/CocoaPods workspaces
//!
//! Replaces recompilation of framework targets with reuse of previously
//! built binaries, keyed by a deterministic fingerprint of each target's
//! inputs. The crate is organized around a small set of components:
//!
//! - `fingerprint`: content-addressed per-target identifiers
//! - `store`: the local content-addressed binary cache
//! - `mutator`: project-graph rewriting to consume binaries
//! - `journal`: crash-safe snapshot/restore of project files
//! - `orchestrator`: the build/use/rebuild/rollback workflows
//! - `remote`: compressed parallel transfer to an S3-compatible store
//! - `impact`: change-to-test-target mapping
//!
//! External dependencies (project format, version control, the native
//! build tool, toolchains, the clock) sit behind capability traits in
//! `env`, with in-memory doubles in `mock`.

pub mod env;
pub mod fingerprint;
pub mod flags;
pub mod graph;
pub mod hashers;
pub mod impact;
pub mod journal;
pub mod mock;
pub mod mutator;
pub mod orchestrator;
pub mod remote;
pub mod signal;
pub mod store;

pub use env::{
    BuildOutcome, BuildRequest, CancelToken, Clock, CollaboratorError, DebugOptions, Environment,
    GitVcs, HostToolchains, JsonProject, NativeBuilder, ProducedArtifact, ProjectReader,
    ProjectWriter, SystemClock, Toolchains, Vcs, XcodeBuilder, XcodeVersion,
};
pub use fingerprint::{FingerprintEngine, FingerprintError, CYCLE_SENTINEL};
pub use flags::{Arch, BuildFlags, Sdk};
pub use graph::{
    BuildPhase, BuildRule, BuildSettings, ProjectGraph, Product, ScriptPhase, SettingValue, Target,
    TargetId, TargetKind,
};
pub use hashers::{ContentHashers, Subhashers};
pub use impact::{ChangeScope, ImpactAnalyzer};
pub use journal::{BackupJournal, JournalError, JournalSlot};
pub use mutator::{ProjectMutator, AGGREGATE_TARGET_NAME, PATCH_MARKER};
pub use orchestrator::{
    CacheOutcome, Orchestrator, RugbyPaths, TargetSelector, WorkflowError, WorkflowReport,
};
pub use remote::{
    ArchiveFormat, Credentials, Endpoint, EndpointStyle, ObjectResult, RemoteConfig, RemoteError,
    RemoteTransport,
};
pub use signal::{SignalHandler, SignalState};
pub use store::{BinaryStore, CacheEntry, EntryMetadata, StoreError, StoreUsage};
