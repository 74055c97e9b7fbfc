//! Workflow orchestration
//!
//! Composes the fingerprint engine, binary store, project mutator and
//! backup journal into the user-facing workflows:
//! - `build`: fingerprint, reuse hits, natively build misses, import
//! - `use`: bind to existing binaries, never build
//! - `rebuild`: force-rebuild the selection, then rebind everything
//! - `rollback`: restore the pristine project
//! - `local-changes`: keep touched packages as source, rebind the rest
//!
//! Every mutating workflow snapshots the `tmp` journal slot first and
//! restores it on failure or interruption, so a crashed run never leaves
//! the project half-patched.

mod selection;

pub use selection::{SelectionError, TargetSelector, DENY_MARKER};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::env::{
    BuildRequest, CancelToken, CollaboratorError, NativeBuilder, ProjectReader, ProjectWriter,
    Toolchains, Vcs,
};
use crate::fingerprint::{FingerprintEngine, FingerprintError};
use crate::flags::BuildFlags;
use crate::graph::{GraphError, ProjectGraph, TargetId};
use crate::hashers::Subhashers;
use crate::impact::{ChangeScope, ImpactAnalyzer};
use crate::journal::{BackupJournal, JournalError, JournalSlot};
use crate::mutator::{ProjectMutator, AGGREGATE_TARGET_NAME};
use crate::store::{BinaryStore, CacheEntry, StoreError};

/// Result type for workflows
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors surfaced by workflows
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("selection yielded no build targets")]
    NoBuildTargets,

    #[error("no snapshot to roll back to")]
    NoSnapshot,

    #[error("project is already bound to cached binaries")]
    AlreadyPatched,

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("journal error: {0}")]
    Journal(JournalError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("interrupted")]
    Interrupted,
}

impl From<JournalError> for WorkflowError {
    fn from(e: JournalError) -> Self {
        match e {
            JournalError::NoSnapshot(_) => WorkflowError::NoSnapshot,
            other => WorkflowError::Journal(other),
        }
    }
}

impl WorkflowError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowError::NoBuildTargets => 10,
            WorkflowError::NoSnapshot => 11,
            WorkflowError::AlreadyPatched => 12,
            WorkflowError::Selection(_) => 13,
            WorkflowError::Fingerprint(_) => 40,
            WorkflowError::Store(_) => 50,
            WorkflowError::Journal(_) => 60,
            WorkflowError::Graph(_) => 61,
            WorkflowError::Collaborator(_) => 70,
            WorkflowError::Interrupted => 80,
        }
    }
}

/// Well-known paths under the shared root.
#[derive(Debug, Clone)]
pub struct RugbyPaths {
    /// Workspace root the project files live under
    pub workspace: PathBuf,
    /// Shared rugby root (cache, journal)
    pub rugby_root: PathBuf,
}

impl RugbyPaths {
    pub fn new(workspace: impl Into<PathBuf>, rugby_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            rugby_root: rugby_root.into(),
        }
    }

    /// The binary store root.
    pub fn bin(&self) -> PathBuf {
        self.rugby_root.join("bin")
    }

    /// The journal root.
    pub fn backup(&self) -> PathBuf {
        self.rugby_root.join("backup")
    }
}

/// Summary of one workflow run.
#[derive(Debug, Clone, Default)]
pub struct WorkflowReport {
    /// Targets bound to existing cache entries
    pub hits: Vec<TargetId>,
    /// Targets that had to be built (or could not be bound, for `use`)
    pub misses: Vec<TargetId>,
    /// Entries imported into the store by this run
    pub imported: usize,
    /// Targets patched during finalize
    pub patched: usize,
}

/// Outcome of the build workflow's planning step. An already-patched
/// project is not an error here; the caller decides whether to surface it
/// or branch into a rebuild.
#[derive(Debug)]
pub enum CacheOutcome {
    Done(WorkflowReport),
    AlreadyPatched,
}

/// The workflow orchestrator. Owns the project graph for the lifetime of
/// one workflow; collaborators are shared and immutable.
pub struct Orchestrator {
    paths: RugbyPaths,
    reader: Arc<dyn ProjectReader>,
    writer: Arc<dyn ProjectWriter>,
    builder: Arc<dyn NativeBuilder>,
    vcs: Arc<dyn Vcs>,
    toolchains: Arc<dyn Toolchains>,
    hashers: Subhashers,
    store: BinaryStore,
    journal: BackupJournal,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(
        paths: RugbyPaths,
        reader: Arc<dyn ProjectReader>,
        writer: Arc<dyn ProjectWriter>,
        builder: Arc<dyn NativeBuilder>,
        vcs: Arc<dyn Vcs>,
        toolchains: Arc<dyn Toolchains>,
    ) -> Self {
        let store = BinaryStore::new(paths.bin());
        let journal = BackupJournal::new(paths.backup(), &paths.workspace);
        Self {
            paths,
            reader,
            writer,
            builder,
            vcs,
            toolchains,
            hashers: Subhashers::default(),
            store,
            journal,
            cancel: CancelToken::new(),
        }
    }

    /// Replace the default subhashers.
    pub fn with_hashers(mut self, hashers: Subhashers) -> Self {
        self.hashers = hashers;
        self
    }

    /// Share a cancellation token with the signal handler.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &BinaryStore {
        &self.store
    }

    pub fn paths(&self) -> &RugbyPaths {
        &self.paths
    }

    fn check_interrupted(&self) -> WorkflowResult<()> {
        if self.cancel.is_cancelled() {
            Err(WorkflowError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Restore and discard the `tmp` slot after a failed workflow.
    fn recover(&self) {
        if let Err(e) = self.journal.restore(JournalSlot::Tmp) {
            warn!(error = %e, "journal restore failed during recovery");
        }
        if let Err(e) = self.journal.discard(JournalSlot::Tmp) {
            warn!(error = %e, "journal discard failed during recovery");
        }
    }

    /// Run `inner`, recovering the journal if it fails after the `tmp`
    /// snapshot was taken.
    fn with_recovery<T>(
        &self,
        inner: impl FnOnce(&mut bool) -> WorkflowResult<T>,
    ) -> WorkflowResult<T> {
        let mut snapshotted = false;
        match inner(&mut snapshotted) {
            Ok(value) => Ok(value),
            Err(error) => {
                if snapshotted {
                    self.recover();
                }
                Err(error)
            }
        }
    }

    /// Snapshot `tmp`, plus `original` if this is the first mutation of a
    /// clean project.
    fn snapshot_for_mutation(&self, graph: &ProjectGraph, snapshotted: &mut bool) -> WorkflowResult<()> {
        let files = &graph.workspace.project_files;
        self.journal.snapshot(JournalSlot::Tmp, files)?;
        *snapshotted = true;
        if !self.journal.exists(JournalSlot::Original) {
            self.journal.snapshot(JournalSlot::Original, files)?;
        }
        Ok(())
    }

    /// Fingerprint the selection's transitive closure.
    fn hash_targets(
        &self,
        graph: &mut ProjectGraph,
        selection: &BTreeSet<TargetId>,
        flags: &BuildFlags,
        rehash: bool,
    ) -> WorkflowResult<()> {
        let engine = FingerprintEngine::new(self.toolchains.as_ref(), &self.hashers);
        let closure = graph.closure_of(selection)?;
        engine.hash(graph, &closure, flags, rehash)?;
        Ok(())
    }

    /// Partition a fingerprinted selection into cache hits and misses.
    fn partition(
        &self,
        graph: &ProjectGraph,
        selection: &BTreeSet<TargetId>,
        flags: &BuildFlags,
    ) -> WorkflowResult<(Vec<(TargetId, CacheEntry)>, BTreeSet<TargetId>)> {
        let mut hits = Vec::new();
        let mut misses = BTreeSet::new();
        for id in selection {
            let target = graph.target(id)?;
            if flags.ignore_cache {
                misses.insert(id.clone());
                continue;
            }
            match self.store.lookup(target, flags)? {
                Some(entry) => hits.push((id.clone(), entry)),
                None => {
                    misses.insert(id.clone());
                }
            }
        }
        Ok((hits, misses))
    }

    /// Every cacheable fingerprinted target with a matching store entry.
    fn available_binaries(
        &self,
        graph: &ProjectGraph,
        flags: &BuildFlags,
    ) -> WorkflowResult<Vec<(TargetId, CacheEntry)>> {
        let mut plan = Vec::new();
        for target in graph.targets() {
            if !target.kind.is_cacheable() || !target.has_fingerprint() {
                continue;
            }
            if let Some(entry) = self.store.lookup(target, flags)? {
                plan.push((target.id.clone(), entry));
            }
        }
        Ok(plan)
    }

    /// Import freshly produced artifacts for the missed targets.
    fn import_produced(
        &self,
        graph: &ProjectGraph,
        misses: &BTreeSet<TargetId>,
        flags: &BuildFlags,
        produced: &[crate::env::ProducedArtifact],
    ) -> WorkflowResult<usize> {
        let mut imported = 0;
        for artifact in produced {
            let target = misses
                .iter()
                .filter_map(|id| graph.target(id).ok())
                .find(|t| t.product_name() == artifact.product_name);
            match target {
                Some(target) => {
                    self.store.import(target, flags, &artifact.dir)?;
                    imported += 1;
                }
                None => {
                    warn!(product = %artifact.product_name, "build produced an unplanned artifact");
                }
            }
        }
        if imported > 0 {
            self.store.refresh_latest()?;
        }
        Ok(imported)
    }

    /// Restore the pre-build project, rebind every available binary, stamp
    /// the patch sentinel and persist.
    fn finalize(&self, flags: &BuildFlags) -> WorkflowResult<usize> {
        self.journal.restore(JournalSlot::Tmp)?;

        let mut fresh = self.reader.read()?;
        // Binaries outside the selection may exist from earlier runs; hash
        // every cacheable target so they rebind too.
        let everything: BTreeSet<TargetId> = fresh
            .targets()
            .filter(|t| t.kind.is_cacheable())
            .map(|t| t.id.clone())
            .collect();
        self.hash_targets(&mut fresh, &everything, flags, false)?;

        let plan = self.available_binaries(&fresh, flags)?;
        let patched = plan.len();
        ProjectMutator::patch_linkage(&mut fresh, &plan)?;
        ProjectMutator::mark_patched(&mut fresh);
        self.writer.write(&fresh)?;
        self.journal.discard(JournalSlot::Tmp)?;
        Ok(patched)
    }

    /// The build workflow: reuse hits, natively build misses, import the
    /// results and rebind the project.
    pub fn build(
        &self,
        selector: &TargetSelector,
        flags: &BuildFlags,
    ) -> WorkflowResult<CacheOutcome> {
        self.with_recovery(|snapshotted| self.build_inner(selector, flags, snapshotted))
    }

    fn build_inner(
        &self,
        selector: &TargetSelector,
        flags: &BuildFlags,
        snapshotted: &mut bool,
    ) -> WorkflowResult<CacheOutcome> {
        let mut graph = self.reader.read()?;
        if ProjectMutator::is_patched(&graph) {
            return Ok(CacheOutcome::AlreadyPatched);
        }

        let selection = selector.select(&graph);
        if selection.is_empty() {
            return Err(WorkflowError::NoBuildTargets);
        }
        info!(targets = selection.len(), "selected build targets");

        self.snapshot_for_mutation(&graph, snapshotted)?;
        self.check_interrupted()?;

        self.hash_targets(&mut graph, &selection, flags, false)?;
        let (hits, misses) = self.partition(&graph, &selection, flags)?;
        info!(hits = hits.len(), misses = misses.len(), "cache plan");

        let mut report = WorkflowReport {
            hits: hits.iter().map(|(id, _)| id.clone()).collect(),
            misses: misses.iter().cloned().collect(),
            ..Default::default()
        };

        if misses.is_empty() {
            report.patched = self.finalize(flags)?;
            return Ok(CacheOutcome::Done(report));
        }

        ProjectMutator::patch_linkage(&mut graph, &hits)?;
        ProjectMutator::create_aggregate_target(&mut graph, AGGREGATE_TARGET_NAME, &misses)?;
        self.writer.write(&graph)?;
        self.check_interrupted()?;

        let request = BuildRequest {
            target: AGGREGATE_TARGET_NAME.to_string(),
            flags: flags.clone(),
        };
        let outcome = self.builder.build(&request, &self.cancel)?;
        self.check_interrupted()?;

        report.imported = self.import_produced(&graph, &misses, flags, &outcome.produced)?;
        report.patched = self.finalize(flags)?;
        Ok(CacheOutcome::Done(report))
    }

    /// The use workflow: bind hits, report misses, never build.
    pub fn use_binaries(
        &self,
        selector: &TargetSelector,
        flags: &BuildFlags,
    ) -> WorkflowResult<WorkflowReport> {
        self.with_recovery(|snapshotted| self.use_inner(selector, flags, snapshotted))
    }

    fn use_inner(
        &self,
        selector: &TargetSelector,
        flags: &BuildFlags,
        snapshotted: &mut bool,
    ) -> WorkflowResult<WorkflowReport> {
        let mut graph = self.reader.read()?;
        let selection = selector.select(&graph);
        if selection.is_empty() {
            return Err(WorkflowError::NoBuildTargets);
        }

        self.snapshot_for_mutation(&graph, snapshotted)?;
        self.check_interrupted()?;

        self.hash_targets(&mut graph, &selection, flags, false)?;
        let (hits, misses) = self.partition(&graph, &selection, flags)?;
        if !misses.is_empty() {
            warn!(
                misses = misses.len(),
                "targets without cache entries stay as source"
            );
        }

        let report = WorkflowReport {
            hits: hits.iter().map(|(id, _)| id.clone()).collect(),
            misses: misses.iter().cloned().collect(),
            imported: 0,
            patched: hits.len(),
        };

        ProjectMutator::patch_linkage(&mut graph, &hits)?;
        ProjectMutator::mark_patched(&mut graph);
        self.writer.write(&graph)?;
        self.journal.discard(JournalSlot::Tmp)?;
        Ok(report)
    }

    /// The rebuild workflow: force-rebuild exactly the selected targets
    /// against a pre-patched project, then rebind everything available.
    pub fn rebuild(
        &self,
        selector: &TargetSelector,
        flags: &BuildFlags,
    ) -> WorkflowResult<WorkflowReport> {
        self.with_recovery(|snapshotted| self.rebuild_inner(selector, flags, snapshotted))
    }

    fn rebuild_inner(
        &self,
        selector: &TargetSelector,
        flags: &BuildFlags,
        snapshotted: &mut bool,
    ) -> WorkflowResult<WorkflowReport> {
        let mut graph = self.reader.read()?;
        if ProjectMutator::is_patched(&graph) {
            // Resolve the selection against the pristine project.
            self.journal.restore(JournalSlot::Original)?;
            graph = self.reader.read()?;
        }

        let selection = selector.select(&graph);
        if selection.is_empty() {
            return Err(WorkflowError::NoBuildTargets);
        }

        self.snapshot_for_mutation(&graph, snapshotted)?;
        self.check_interrupted()?;

        self.hash_targets(&mut graph, &selection, flags, true)?;

        // Only the explicitly requested targets are rebuilt; their
        // dependencies are presumed cached.
        let misses = selection.clone();
        let dependencies = self
            .available_binaries(&graph, flags)?
            .into_iter()
            .filter(|(id, _)| !misses.contains(id))
            .collect::<Vec<_>>();

        ProjectMutator::patch_linkage(&mut graph, &dependencies)?;
        ProjectMutator::create_aggregate_target(&mut graph, AGGREGATE_TARGET_NAME, &misses)?;
        self.writer.write(&graph)?;
        self.check_interrupted()?;

        let request = BuildRequest {
            target: AGGREGATE_TARGET_NAME.to_string(),
            flags: flags.clone(),
        };
        let outcome = self.builder.build(&request, &self.cancel)?;
        self.check_interrupted()?;

        let imported = self.import_produced(&graph, &misses, flags, &outcome.produced)?;
        let patched = self.finalize(flags)?;

        Ok(WorkflowReport {
            hits: Vec::new(),
            misses: misses.into_iter().collect(),
            imported,
            patched,
        })
    }

    /// The rollback workflow: restore the pristine project.
    pub fn rollback(&self) -> WorkflowResult<()> {
        self.journal.restore(JournalSlot::Original)?;
        self.journal.discard(JournalSlot::Tmp)?;
        info!("project restored from original snapshot");
        Ok(())
    }

    /// The local-changes workflow: roll back, then re-bind to binaries
    /// while keeping every package with uncommitted changes as source.
    pub fn source_local_changes(
        &self,
        selector: TargetSelector,
        flags: &BuildFlags,
    ) -> WorkflowResult<WorkflowReport> {
        let uncommitted = self.vcs.uncommitted_files()?;
        let affected = ImpactAnalyzer::affected_packages(&uncommitted);
        info!(packages = affected.len(), "packages with local changes stay as source");

        self.rollback()?;

        let selector = selector.with_except_names(affected);
        self.use_binaries(&selector, flags)
    }

    /// Compute the test targets impacted by changes since `scope`.
    pub fn test_impact(&self, scope: &ChangeScope) -> WorkflowResult<BTreeSet<TargetId>> {
        let graph = self.reader.read()?;
        Ok(ImpactAnalyzer::analyze(self.vcs.as_ref(), &graph, scope)?)
    }
}
