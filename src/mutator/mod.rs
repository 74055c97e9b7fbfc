//! In-memory project mutation
//!
//! All graph rewrites funnel through here: binding targets to cached
//! binaries, stamping the patch sentinel, and creating the synthetic
//! aggregate target the native builder compiles. Methods are synchronous
//! value-level manipulations; persisting the result is the caller's job
//! via the project writer.

use std::collections::BTreeSet;

use tracing::debug;

use crate::graph::{
    BuildSettings, GraphError, ProjectGraph, SettingValue, Target, TargetId, TargetKind,
};
use crate::store::CacheEntry;

/// Workspace marker key stamped on patched projects.
pub const PATCH_MARKER: &str = "RUGBY_PATCHED";

/// Name of the synthetic target that aggregates all residue targets.
pub const AGGREGATE_TARGET_NAME: &str = "RugbyPods";

/// Settings keys the linkage patch touches.
const FRAMEWORK_SEARCH_PATHS: &str = "FRAMEWORK_SEARCH_PATHS";
const LIBRARY_SEARCH_PATHS: &str = "LIBRARY_SEARCH_PATHS";
const HEADER_SEARCH_PATHS: &str = "HEADER_SEARCH_PATHS";
const OTHER_LDFLAGS: &str = "OTHER_LDFLAGS";

/// The project mutator.
pub struct ProjectMutator;

impl ProjectMutator {
    /// Stamp the graph as consuming cached binaries.
    pub fn mark_patched(graph: &mut ProjectGraph) {
        graph
            .workspace
            .markers
            .insert(PATCH_MARKER.to_string(), "YES".to_string());
    }

    /// Whether a previous run already patched this graph.
    pub fn is_patched(graph: &ProjectGraph) -> bool {
        graph
            .workspace
            .markers
            .get(PATCH_MARKER)
            .map(|v| v == "YES")
            .unwrap_or(false)
    }

    /// Rewrite each planned target to consume its cached binary.
    ///
    /// Adds the entry directory to the search paths, links the product,
    /// and removes compile phases so the native build skips the sources.
    /// Untouched settings are preserved. Applying the same plan twice is a
    /// no-op.
    pub fn patch_linkage(
        graph: &mut ProjectGraph,
        plan: &[(TargetId, CacheEntry)],
    ) -> Result<(), GraphError> {
        for (id, entry) in plan {
            let target = graph.target_mut(id)?;
            let entry_dir = entry.path.to_string_lossy().into_owned();
            let link_flag = link_flag_for(target);

            if target.configurations.is_empty() {
                // A target with no explicit configurations still needs the
                // linkage settings somewhere the build reads them.
                target
                    .configurations
                    .insert(entry.metadata.config.clone(), BuildSettings::new());
            }

            for settings in target.configurations.values_mut() {
                append_unique(settings, FRAMEWORK_SEARCH_PATHS, &entry_dir);
                append_unique(settings, LIBRARY_SEARCH_PATHS, &entry_dir);
                append_unique(settings, HEADER_SEARCH_PATHS, &entry_dir);
                if let Some(flag) = &link_flag {
                    append_unique(settings, OTHER_LDFLAGS, flag);
                }
            }

            let before = target.build_phases.len();
            target.build_phases.retain(|phase| !phase.is_compile());
            if target.build_phases.len() != before {
                debug!(target = %target.name, "removed compile phases");
            }
        }
        graph.reset_resolved();
        Ok(())
    }

    /// Create (or refresh) a synthetic aggregate target depending on every
    /// member of `dependencies`. The native builder drives this single
    /// target to compile all residue targets in one invocation.
    pub fn create_aggregate_target(
        graph: &mut ProjectGraph,
        name: &str,
        dependencies: &BTreeSet<TargetId>,
    ) -> Result<TargetId, GraphError> {
        let id = TargetId::new(name);
        if graph.contains(&id) {
            let target = graph.target_mut(&id)?;
            target.explicit_dependencies = dependencies.clone();
        } else {
            let mut target = Target::new(name, name, TargetKind::Aggregate);
            target.explicit_dependencies = dependencies.clone();
            graph.insert(target)?;
        }
        graph.reset_resolved();
        Ok(id)
    }

    /// Drop source-group references of the listed targets.
    pub fn remove_groups(
        graph: &mut ProjectGraph,
        targets: &BTreeSet<TargetId>,
    ) -> Result<(), GraphError> {
        for id in targets {
            graph.target_mut(id)?.source_groups.clear();
        }
        Ok(())
    }

    /// Drop memoized graph state so subsequent reads resolve fresh.
    pub fn reset_cache(graph: &mut ProjectGraph) {
        graph.reset_resolved();
    }
}

/// The linker flag binding a consumer to this product, if the kind takes
/// one.
fn link_flag_for(target: &Target) -> Option<String> {
    match target.kind {
        TargetKind::Framework | TargetKind::DynLib => {
            Some(format!("-framework {}", product_module(target)))
        }
        TargetKind::StaticLib => Some(format!("-l{}", product_module(target))),
        _ => None,
    }
}

fn product_module(target: &Target) -> String {
    target
        .product
        .as_ref()
        .and_then(|p| p.module_name.clone())
        .unwrap_or_else(|| target.product_name().to_string())
}

/// Append `value` to a list-valued setting unless it is already present.
fn append_unique(settings: &mut BuildSettings, key: &str, value: &str) {
    match settings.get_mut(key) {
        Some(SettingValue::List(items)) => {
            if !items.iter().any(|v| v == value) {
                items.push(value.to_string());
            }
        }
        Some(SettingValue::String(existing)) => {
            if existing != value {
                let merged = vec![existing.clone(), value.to_string()];
                settings.insert(key.to_string(), SettingValue::List(merged));
            }
        }
        None => {
            settings.insert(key.to_string(), SettingValue::List(vec![value.to_string()]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntryMetadata;
    use chrono::Utc;
    use std::path::PathBuf;

    fn cache_entry(product: &str, fingerprint: &str) -> CacheEntry {
        CacheEntry {
            path: PathBuf::from(format!("/cache/bin/{product}/Debug-sim-arm64/{fingerprint}")),
            metadata: EntryMetadata {
                fingerprint: fingerprint.to_string(),
                product: product.to_string(),
                config: "Debug".to_string(),
                sdk: "sim".to_string(),
                arch: "arm64".to_string(),
                created_at: Utc::now(),
            },
            size_bytes: 0,
        }
    }

    fn framework_target(name: &str) -> Target {
        let mut target = Target::new(name, name, TargetKind::Framework);
        target.configurations.insert("Debug".to_string(), BuildSettings::new());
        target.build_phases.push(crate::graph::BuildPhase {
            name: "Sources".to_string(),
            kind: "sources".to_string(),
            files: vec!["A.swift".to_string()],
        });
        target.build_phases.push(crate::graph::BuildPhase {
            name: "Resources".to_string(),
            kind: "resources".to_string(),
            files: vec![],
        });
        target
    }

    #[test]
    fn test_mark_and_detect_patched() {
        let mut graph = ProjectGraph::new("Test");
        assert!(!ProjectMutator::is_patched(&graph));
        ProjectMutator::mark_patched(&mut graph);
        assert!(ProjectMutator::is_patched(&graph));
    }

    #[test]
    fn test_patch_linkage_sets_search_paths_and_drops_compile() {
        let mut graph = ProjectGraph::new("Test");
        graph.insert(framework_target("Alamofire")).unwrap();

        let plan = vec![("Alamofire".into(), cache_entry("Alamofire", "aa11"))];
        ProjectMutator::patch_linkage(&mut graph, &plan).unwrap();

        let target = graph.target(&"Alamofire".into()).unwrap();
        let settings = &target.configurations["Debug"];
        let fsp = match &settings[FRAMEWORK_SEARCH_PATHS] {
            SettingValue::List(items) => items.clone(),
            other => panic!("unexpected setting shape: {other:?}"),
        };
        assert_eq!(fsp, vec!["/cache/bin/Alamofire/Debug-sim-arm64/aa11"]);
        assert!(settings.contains_key(OTHER_LDFLAGS));

        // Compile phase gone, resources kept.
        assert!(target.build_phases.iter().all(|p| !p.is_compile()));
        assert_eq!(target.build_phases.len(), 1);
    }

    #[test]
    fn test_patch_linkage_is_idempotent() {
        let mut graph = ProjectGraph::new("Test");
        graph.insert(framework_target("Alamofire")).unwrap();
        let plan = vec![("Alamofire".into(), cache_entry("Alamofire", "aa11"))];

        ProjectMutator::patch_linkage(&mut graph, &plan).unwrap();
        let once = graph.target(&"Alamofire".into()).unwrap().clone();
        ProjectMutator::patch_linkage(&mut graph, &plan).unwrap();
        let twice = graph.target(&"Alamofire".into()).unwrap();

        assert_eq!(once.configurations, twice.configurations);
        assert_eq!(once.build_phases, twice.build_phases);
    }

    #[test]
    fn test_patch_preserves_unrelated_settings() {
        let mut graph = ProjectGraph::new("Test");
        let mut target = framework_target("Alamofire");
        target
            .configurations
            .get_mut("Debug")
            .unwrap()
            .insert("SWIFT_VERSION".to_string(), SettingValue::from("5.0"));
        graph.insert(target).unwrap();

        let plan = vec![("Alamofire".into(), cache_entry("Alamofire", "aa11"))];
        ProjectMutator::patch_linkage(&mut graph, &plan).unwrap();

        let settings = &graph.target(&"Alamofire".into()).unwrap().configurations["Debug"];
        assert_eq!(settings["SWIFT_VERSION"], SettingValue::from("5.0"));
    }

    #[test]
    fn test_create_aggregate_target() {
        let mut graph = ProjectGraph::new("Test");
        graph.insert(framework_target("A")).unwrap();
        graph.insert(framework_target("B")).unwrap();

        let deps: BTreeSet<TargetId> = ["A".into(), "B".into()].into();
        let id = ProjectMutator::create_aggregate_target(&mut graph, AGGREGATE_TARGET_NAME, &deps)
            .unwrap();

        let aggregate = graph.target(&id).unwrap();
        assert_eq!(aggregate.kind, TargetKind::Aggregate);
        assert_eq!(aggregate.explicit_dependencies, deps);
    }

    #[test]
    fn test_create_aggregate_twice_refreshes_deps() {
        let mut graph = ProjectGraph::new("Test");
        graph.insert(framework_target("A")).unwrap();
        graph.insert(framework_target("B")).unwrap();

        let first: BTreeSet<TargetId> = ["A".into()].into();
        ProjectMutator::create_aggregate_target(&mut graph, AGGREGATE_TARGET_NAME, &first).unwrap();
        let second: BTreeSet<TargetId> = ["B".into()].into();
        let id =
            ProjectMutator::create_aggregate_target(&mut graph, AGGREGATE_TARGET_NAME, &second)
                .unwrap();

        assert_eq!(graph.target(&id).unwrap().explicit_dependencies, second);
    }

    #[test]
    fn test_remove_groups() {
        let mut graph = ProjectGraph::new("Test");
        let mut target = framework_target("A");
        target.source_groups.push("Pods/A".to_string());
        graph.insert(target).unwrap();

        let ids: BTreeSet<TargetId> = ["A".into()].into();
        ProjectMutator::remove_groups(&mut graph, &ids).unwrap();
        assert!(graph.target(&"A".into()).unwrap().source_groups.is_empty());
    }

    #[test]
    fn test_reset_cache_forces_fresh_resolution() {
        let mut graph = ProjectGraph::new("Test");
        let mut a = framework_target("A");
        a.explicit_dependencies.insert("B".into());
        graph.insert(a).unwrap();
        graph.insert(framework_target("B")).unwrap();

        // Materialize the closure, then mutate an edge directly.
        let before = graph.resolved_dependencies(&"A".into()).unwrap();
        assert_eq!(before.len(), 1);
        graph
            .target_mut(&"B".into())
            .unwrap()
            .explicit_dependencies
            .insert("A".into());

        ProjectMutator::reset_cache(&mut graph);
        let after = graph.resolved_dependencies(&"A".into()).unwrap();
        assert!(after.contains(&TargetId::from("A")), "stale closure served");
    }

    #[test]
    fn test_static_lib_links_with_dash_l() {
        let mut graph = ProjectGraph::new("Test");
        let mut target = framework_target("CoreUtils");
        target.kind = TargetKind::StaticLib;
        graph.insert(target).unwrap();

        let plan = vec![("CoreUtils".into(), cache_entry("CoreUtils", "bb22"))];
        ProjectMutator::patch_linkage(&mut graph, &plan).unwrap();

        let settings = &graph.target(&"CoreUtils".into()).unwrap().configurations["Debug"];
        match &settings[OTHER_LDFLAGS] {
            SettingValue::List(items) => assert!(items.contains(&"-lCoreUtils".to_string())),
            other => panic!("unexpected setting shape: {other:?}"),
        }
    }
}
