//! Test-impact analysis
//!
//! Maps file-level version-control changes to the set of test targets
//! whose outcome may have changed. Podspec edits are matched precisely
//! against direct dependencies; any other source change conservatively
//! marks every test target (per-file target containment is a future
//! refinement).

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::env::{CollaboratorError, Vcs};
use crate::graph::{ProjectGraph, TargetId, TargetKind};

/// File suffixes that can affect a build or test outcome.
pub const RELEVANT_SUFFIXES: &[&str] = &[
    "swift", "h", "m", "mm", "c", "cpp", "podspec", "xcconfig",
];

/// Directory names that contain packages; the package name is the next
/// path component.
const CONTAINER_DIRS: &[&str] = &["services", "frameworks", "modules", "LocalPods", "Pods"];

/// Conventional subdirectories that are never package names.
const SKIP_DIRS: &[&str] = &["Sources", "Tests", "Resources", "Example", "Demo"];

/// Paths under this prefix never map to a local package.
const IGNORED_PREFIX: &str = "ExternalFrameworks";

/// What to measure changes against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeScope {
    /// Everything changed since the given commit reference
    SinceRef(String),
    /// Uncommitted changes only
    Uncommitted,
}

/// The test-impact analyzer.
pub struct ImpactAnalyzer;

impl ImpactAnalyzer {
    /// Compute the impacted test targets for the given change scope.
    pub fn analyze(
        vcs: &dyn Vcs,
        graph: &ProjectGraph,
        scope: &ChangeScope,
    ) -> Result<BTreeSet<TargetId>, CollaboratorError> {
        let changed = match scope {
            ChangeScope::SinceRef(base) => vcs.changed_files(base)?,
            ChangeScope::Uncommitted => vcs.uncommitted_files()?,
        };
        Ok(Self::impacted_test_targets(graph, &changed))
    }

    /// Map changed paths to impacted test targets.
    pub fn impacted_test_targets(graph: &ProjectGraph, changed: &[PathBuf]) -> BTreeSet<TargetId> {
        let relevant: Vec<&PathBuf> = changed
            .iter()
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| RELEVANT_SUFFIXES.contains(&e))
                    .unwrap_or(false)
            })
            .collect();

        let (podspec_changes, source_changes): (Vec<&PathBuf>, Vec<&PathBuf>) = relevant
            .into_iter()
            .partition(|path| path.extension().and_then(|e| e.to_str()) == Some("podspec"));

        let mut impacted = BTreeSet::new();

        for podspec in &podspec_changes {
            let Some(package) = podspec.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            for target in graph.targets().filter(|t| t.kind == TargetKind::Tests) {
                let depends = target.explicit_dependencies.iter().any(|dep| {
                    graph
                        .target(dep)
                        .map(|d| d.name.eq_ignore_ascii_case(package))
                        .unwrap_or(false)
                });
                if depends {
                    impacted.insert(target.id.clone());
                }
            }
        }

        // Without a precise file-to-target mapping, any remaining source
        // change marks every test target.
        if !source_changes.is_empty() && impacted.is_empty() {
            debug!(
                changes = source_changes.len(),
                "source changes without podspec impact, marking all test targets"
            );
            impacted.extend(
                graph
                    .targets()
                    .filter(|t| t.kind == TargetKind::Tests)
                    .map(|t| t.id.clone()),
            );
        }

        impacted
    }

    /// Map an uncommitted file path to the package it belongs to.
    ///
    /// Scans for a well-known container directory and takes the following
    /// component, skipping conventional non-package subdirectories. The
    /// chosen component must not be the file itself.
    pub fn package_for_path(path: &Path) -> Option<String> {
        let components: Vec<&str> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();

        if components.iter().any(|c| *c == IGNORED_PREFIX) {
            return None;
        }

        let container_index = components
            .iter()
            .position(|c| CONTAINER_DIRS.contains(c))?;

        let last = components.len().checked_sub(1)?;
        components
            .iter()
            .enumerate()
            .skip(container_index + 1)
            .find(|(index, name)| *index < last && !SKIP_DIRS.contains(*name))
            .map(|(_, name)| name.to_string())
    }

    /// The set of package names touched by the given paths.
    pub fn affected_packages(paths: &[PathBuf]) -> BTreeSet<String> {
        paths
            .iter()
            .filter_map(|p| Self::package_for_path(p))
            .collect()
    }
}
