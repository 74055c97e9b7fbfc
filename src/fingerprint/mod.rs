//! Per-target fingerprint engine
//!
//! Computes a content-addressed identifier for every target in the
//! selection's transitive closure. A target's fingerprint folds in its own
//! structural inputs plus the fingerprints of its *direct* dependencies
//! only; transitive change propagates exactly when it changes a direct
//! dependency's own fingerprint. This keeps a deep leaf edit from
//! invalidating unrelated subtrees.
//!
//! Traversal finalizes dependencies before dependents, memoized per run.
//! Cyclic edges are tolerated: an in-progress dependency contributes the
//! fixed `"<cycle>"` sentinel instead of recursing, so every member of a
//! cycle still receives a deterministic fingerprint.

mod context;

pub use context::{render, ContextInputs};

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::env::{CollaboratorError, Toolchains, XcodeVersion};
use crate::flags::BuildFlags;
use crate::graph::{GraphError, ProjectGraph, TargetId};
use crate::hashers::Subhashers;

/// Contribution recorded for a dependency edge that closes a cycle.
///
/// Must stay fixed forever: changing it re-keys every cache entry of every
/// cyclic project.
pub const CYCLE_SENTINEL: &str = "<cycle>";

/// Errors from fingerprinting
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// In-progress bookkeeping failed. Unreachable with a correct
    /// traversal; kept as an assertion.
    #[error("cycle detection exhausted at target {0}")]
    CycleExhausted(TargetId),
}

/// The fingerprint engine. Pure CPU; borrows its collaborators.
pub struct FingerprintEngine<'a> {
    toolchains: &'a dyn Toolchains,
    hashers: &'a Subhashers,
}

impl<'a> FingerprintEngine<'a> {
    pub fn new(toolchains: &'a dyn Toolchains, hashers: &'a Subhashers) -> Self {
        Self { toolchains, hashers }
    }

    /// Compute fingerprints for `selection` and its transitive closure.
    ///
    /// Targets that already carry a fingerprint are left untouched unless
    /// `rehash` is set. Roots are visited in id order so results do not
    /// depend on how the selection was assembled.
    pub fn hash(
        &self,
        graph: &mut ProjectGraph,
        selection: &BTreeSet<TargetId>,
        flags: &BuildFlags,
        rehash: bool,
    ) -> Result<(), FingerprintError> {
        let swift_version = self.toolchains.swift_version()?;
        let xcode_version = self.toolchains.xcode_version()?;

        let mut done: BTreeSet<TargetId> = BTreeSet::new();
        let mut in_progress: BTreeSet<TargetId> = BTreeSet::new();

        for root in selection {
            self.visit(
                graph,
                root,
                flags,
                rehash,
                &swift_version,
                &xcode_version,
                &mut done,
                &mut in_progress,
            )?;
        }

        debug!(finalized = done.len(), "fingerprinting complete");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        graph: &mut ProjectGraph,
        id: &TargetId,
        flags: &BuildFlags,
        rehash: bool,
        swift_version: &str,
        xcode_version: &XcodeVersion,
        done: &mut BTreeSet<TargetId>,
        in_progress: &mut BTreeSet<TargetId>,
    ) -> Result<String, FingerprintError> {
        if done.contains(id) {
            return graph
                .target(id)?
                .fingerprint
                .clone()
                .ok_or_else(|| FingerprintError::CycleExhausted(id.clone()));
        }

        {
            let target = graph.target(id)?;
            if !rehash && target.has_fingerprint() {
                let fingerprint = target.fingerprint.clone()
                    .ok_or_else(|| FingerprintError::CycleExhausted(id.clone()))?;
                done.insert(id.clone());
                return Ok(fingerprint);
            }
        }

        if !in_progress.insert(id.clone()) {
            // Callers check membership before recursing; reaching this
            // means the bookkeeping itself broke.
            return Err(FingerprintError::CycleExhausted(id.clone()));
        }

        // Dependency contributions first. Direct edges only; an edge back
        // into the in-progress set contributes the cycle sentinel.
        let dep_ids: Vec<TargetId> = graph
            .target(id)?
            .explicit_dependencies
            .iter()
            .cloned()
            .collect();

        let mut dependencies: BTreeMap<String, String> = BTreeMap::new();
        for dep_id in &dep_ids {
            let dep_name = graph.target(dep_id)?.name.clone();
            let contribution = if in_progress.contains(dep_id) {
                CYCLE_SENTINEL.to_string()
            } else {
                self.visit(
                    graph,
                    dep_id,
                    flags,
                    rehash,
                    swift_version,
                    xcode_version,
                    done,
                    in_progress,
                )?
            };
            dependencies.insert(dep_name, contribution);
        }

        // Subhasher outputs for this target's own structure.
        let target = graph.target(id)?;

        let mut build_phases = Vec::with_capacity(target.build_phases.len());
        for phase in &target.build_phases {
            build_phases.push(self.hashers.phases.hash_phase(phase)?);
        }

        let mut build_rules = Vec::with_capacity(target.build_rules.len());
        for rule in &target.build_rules {
            build_rules.push(self.hashers.rules.hash_rule(rule)?);
        }

        let mut script_phases = Vec::with_capacity(target.script_phases.len());
        for script in &target.script_phases {
            script_phases.push(self.hashers.scripts.hash_script(script)?);
        }

        let mut configurations = Vec::with_capacity(target.configurations.len());
        for (config_name, settings) in &target.configurations {
            configurations.push(
                self.hashers
                    .configurations
                    .hash_configuration(config_name, settings)?,
            );
        }

        let product = target.product.as_ref().map(|p| {
            vec![
                ("moduleName", p.module_name.clone()),
                ("name", Some(p.name.clone())),
                ("parentFolder", p.parent_folder.clone()),
                ("type", Some(p.kind.clone())),
            ]
        });

        let inputs = ContextInputs {
            name: &target.name,
            product,
            swift_version,
            xcode_version,
            xcargs: &flags.xcargs,
            build_phases,
            build_rules,
            script_phases,
            configurations,
            dependencies,
        };

        let document = render(&inputs);
        let fingerprint = hex::encode(Sha256::digest(document.as_bytes()));

        let target = graph.target_mut(id)?;
        target.fingerprint_context = Some(document);
        target.fingerprint = Some(fingerprint.clone());

        in_progress.remove(id);
        done.insert(id.clone());
        Ok(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Target, TargetKind};
    use crate::mock::FixedToolchains;

    fn chain_graph() -> ProjectGraph {
        // App -> Feature -> Service
        let mut graph = ProjectGraph::new("Test");
        let mut app = Target::new("App", "App", TargetKind::Application);
        app.explicit_dependencies.insert("Feature".into());
        let mut feature = Target::new("Feature", "Feature", TargetKind::Framework);
        feature.explicit_dependencies.insert("Service".into());
        let service = Target::new("Service", "Service", TargetKind::Framework);
        graph.insert(app).unwrap();
        graph.insert(feature).unwrap();
        graph.insert(service).unwrap();
        graph
    }

    fn hash_all(graph: &mut ProjectGraph) {
        let toolchains = FixedToolchains::default();
        let hashers = Subhashers::default();
        let engine = FingerprintEngine::new(&toolchains, &hashers);
        let selection: BTreeSet<TargetId> = graph.ids().cloned().collect();
        engine
            .hash(graph, &selection, &BuildFlags::default(), false)
            .unwrap();
    }

    #[test]
    fn test_all_targets_finalized() {
        let mut graph = chain_graph();
        hash_all(&mut graph);
        for target in graph.targets() {
            assert!(target.has_fingerprint(), "{} not finalized", target.name);
        }
    }

    #[test]
    fn test_fingerprints_deterministic() {
        let mut a = chain_graph();
        let mut b = chain_graph();
        hash_all(&mut a);
        hash_all(&mut b);
        for id in a.ids().cloned().collect::<Vec<_>>() {
            assert_eq!(
                a.target(&id).unwrap().fingerprint,
                b.target(&id).unwrap().fingerprint
            );
        }
    }

    #[test]
    fn test_no_rehash_preserves_existing() {
        let mut graph = chain_graph();
        hash_all(&mut graph);
        let before = graph.target(&"App".into()).unwrap().fingerprint.clone();

        // Mutate structure; without rehash nothing recomputes.
        graph
            .target_mut(&"App".into())
            .unwrap()
            .build_phases
            .push(crate::graph::BuildPhase {
                name: "Sources".to_string(),
                kind: "sources".to_string(),
                files: vec!["New.swift".to_string()],
            });
        hash_all(&mut graph);
        assert_eq!(graph.target(&"App".into()).unwrap().fingerprint, before);
    }

    #[test]
    fn test_rehash_recomputes() {
        let mut graph = chain_graph();
        hash_all(&mut graph);
        let before = graph.target(&"App".into()).unwrap().fingerprint.clone();

        graph
            .target_mut(&"App".into())
            .unwrap()
            .build_phases
            .push(crate::graph::BuildPhase {
                name: "Sources".to_string(),
                kind: "sources".to_string(),
                files: vec!["New.swift".to_string()],
            });

        let toolchains = FixedToolchains::default();
        let hashers = Subhashers::default();
        let engine = FingerprintEngine::new(&toolchains, &hashers);
        let selection: BTreeSet<TargetId> = graph.ids().cloned().collect();
        engine
            .hash(&mut graph, &selection, &BuildFlags::default(), true)
            .unwrap();

        assert_ne!(graph.target(&"App".into()).unwrap().fingerprint, before);
    }

    #[test]
    fn test_context_references_direct_dependencies_only() {
        let mut graph = chain_graph();
        hash_all(&mut graph);
        let context = graph
            .target(&"App".into())
            .unwrap()
            .fingerprint_context
            .clone()
            .unwrap();
        assert!(context.contains("Feature"));
        assert!(!context.contains("Service"));
    }

    #[test]
    fn test_xcargs_feed_fingerprint() {
        let mut a = chain_graph();
        let mut b = chain_graph();
        let toolchains = FixedToolchains::default();
        let hashers = Subhashers::default();
        let engine = FingerprintEngine::new(&toolchains, &hashers);
        let selection: BTreeSet<TargetId> = a.ids().cloned().collect();

        engine.hash(&mut a, &selection, &BuildFlags::default(), false).unwrap();
        let flags = BuildFlags {
            xcargs: vec!["COMPILER_INDEX_STORE_ENABLE=NO".to_string()],
            ..Default::default()
        };
        engine.hash(&mut b, &selection, &flags, false).unwrap();

        assert_ne!(
            a.target(&"Service".into()).unwrap().fingerprint,
            b.target(&"Service".into()).unwrap().fingerprint
        );
    }

    #[test]
    fn test_result_bundle_path_not_in_fingerprint() {
        let mut a = chain_graph();
        let mut b = chain_graph();
        let toolchains = FixedToolchains::default();
        let hashers = Subhashers::default();
        let engine = FingerprintEngine::new(&toolchains, &hashers);
        let selection: BTreeSet<TargetId> = a.ids().cloned().collect();

        engine.hash(&mut a, &selection, &BuildFlags::default(), false).unwrap();
        let flags = BuildFlags {
            result_bundle_path: Some("/tmp/result.xcresult".into()),
            ..Default::default()
        };
        engine.hash(&mut b, &selection, &flags, false).unwrap();

        assert_eq!(
            a.target(&"App".into()).unwrap().fingerprint,
            b.target(&"App".into()).unwrap().fingerprint
        );
    }

    #[test]
    fn test_cycle_terminates_and_is_stable() {
        let mut make = || {
            let mut graph = ProjectGraph::new("Cyclic");
            let mut a = Target::new("A", "A", TargetKind::Framework);
            a.explicit_dependencies.insert("B".into());
            let mut b = Target::new("B", "B", TargetKind::Framework);
            b.explicit_dependencies.insert("C".into());
            let mut c = Target::new("C", "C", TargetKind::Framework);
            c.explicit_dependencies.insert("A".into());
            graph.insert(a).unwrap();
            graph.insert(b).unwrap();
            graph.insert(c).unwrap();
            graph
        };

        let mut first = make();
        let mut second = make();
        hash_all(&mut first);
        hash_all(&mut second);

        for id in ["A", "B", "C"] {
            let fp1 = first.target(&id.into()).unwrap().fingerprint.clone();
            let fp2 = second.target(&id.into()).unwrap().fingerprint.clone();
            assert!(fp1.is_some(), "{id} missing fingerprint");
            assert_eq!(fp1, fp2, "{id} unstable across runs");
        }

        // At least one member carries the sentinel in its context.
        let has_sentinel = ["A", "B", "C"].iter().any(|id| {
            first
                .target(&(*id).into())
                .unwrap()
                .fingerprint_context
                .as_ref()
                .unwrap()
                .contains(CYCLE_SENTINEL)
        });
        assert!(has_sentinel);
    }
}
