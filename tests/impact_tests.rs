//! Test-impact analysis against a realistic pods graph

use std::collections::BTreeSet;
use std::path::PathBuf;

use rugby::mock::MockVcs;
use rugby::{ChangeScope, ImpactAnalyzer, ProjectGraph, Target, TargetId, TargetKind};

/// Alamofire <- AlamofireTests, SnapKit <- SnapKitTests,
/// Networking (framework, no tests of its own).
fn pods_graph() -> ProjectGraph {
    let mut graph = ProjectGraph::new("Demo");
    for name in ["Alamofire", "SnapKit", "Networking"] {
        graph
            .insert(Target::new(name, name, TargetKind::Framework))
            .unwrap();
    }
    for (tests, framework) in [
        ("AlamofireTests", "Alamofire"),
        ("SnapKitTests", "SnapKit"),
    ] {
        let mut target = Target::new(tests, tests, TargetKind::Tests);
        target.explicit_dependencies.insert(framework.into());
        graph.insert(target).unwrap();
    }
    graph
}

#[test]
fn test_podspec_edit_impacts_dependents_only() {
    let graph = pods_graph();
    let vcs = MockVcs::new().with_changed(vec![PathBuf::from("Pods/Alamofire/Alamofire.podspec")]);

    let impacted = ImpactAnalyzer::analyze(
        &vcs,
        &graph,
        &ChangeScope::SinceRef("origin/main".to_string()),
    )
    .unwrap();

    assert_eq!(impacted, BTreeSet::from([TargetId::from("AlamofireTests")]));
}

#[test]
fn test_source_edit_impacts_every_test_target() {
    let graph = pods_graph();
    let vcs = MockVcs::new().with_changed(vec![PathBuf::from("Pods/Networking/Source/Client.swift")]);

    let impacted = ImpactAnalyzer::analyze(
        &vcs,
        &graph,
        &ChangeScope::SinceRef("origin/main".to_string()),
    )
    .unwrap();

    assert_eq!(impacted.len(), 2, "conservative fallback marks all tests");
}

#[test]
fn test_uncommitted_scope_uses_uncommitted_paths() {
    let graph = pods_graph();
    let vcs = MockVcs::new()
        .with_changed(vec![PathBuf::from("Pods/Alamofire/Alamofire.podspec")])
        .with_uncommitted(vec![PathBuf::from("Pods/SnapKit/SnapKit.podspec")]);

    let impacted = ImpactAnalyzer::analyze(&vcs, &graph, &ChangeScope::Uncommitted).unwrap();
    assert_eq!(impacted, BTreeSet::from([TargetId::from("SnapKitTests")]));
}

#[test]
fn test_non_code_changes_have_no_impact() {
    let graph = pods_graph();
    let vcs = MockVcs::new().with_changed(vec![
        PathBuf::from("README.md"),
        PathBuf::from("fastlane/Fastfile"),
        PathBuf::from("docs/architecture.png"),
    ]);

    let impacted = ImpactAnalyzer::analyze(
        &vcs,
        &graph,
        &ChangeScope::SinceRef("origin/main".to_string()),
    )
    .unwrap();
    assert!(impacted.is_empty());
}

#[test]
fn test_xcconfig_counts_as_source_change() {
    let graph = pods_graph();
    let vcs = MockVcs::new().with_changed(vec![PathBuf::from("Configs/Shared.xcconfig")]);

    let impacted = ImpactAnalyzer::analyze(
        &vcs,
        &graph,
        &ChangeScope::SinceRef("origin/main".to_string()),
    )
    .unwrap();
    assert_eq!(impacted.len(), 2);
}

#[test]
fn test_external_frameworks_paths_never_map_to_packages() {
    let paths = vec![
        PathBuf::from("ExternalFrameworks/Pods/Vendored/Source/V.swift"),
        PathBuf::from("Pods/Alamofire/Source/AF.swift"),
    ];
    let packages = ImpactAnalyzer::affected_packages(&paths);
    assert_eq!(packages, BTreeSet::from(["Alamofire".to_string()]));
}
