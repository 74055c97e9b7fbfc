//! In-memory project graph
//!
//! Targets live in an arena keyed by `TargetId`; dependency edges store ids,
//! never owning references, so cyclic project graphs are representable. The
//! graph is produced by a `ProjectReader`, mutated only through the project
//! mutator, and persisted by a `ProjectWriter`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque, ordered target identifier, stable across runs for the same
/// project.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of a build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Framework,
    StaticLib,
    DynLib,
    ResourceBundle,
    Tests,
    Application,
    Aggregate,
    Other,
}

impl TargetKind {
    /// Whether binaries of this kind are eligible for the cache.
    ///
    /// Applications and test bundles are rebuilt from source unless a
    /// workflow asks for them explicitly; aggregates are synthetic.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            TargetKind::Framework
                | TargetKind::StaticLib
                | TargetKind::DynLib
                | TargetKind::ResourceBundle
        )
    }
}

/// Product description of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product name (e.g. "Alamofire")
    pub name: String,
    /// Swift module name, when it differs from the product name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    /// Product type string (e.g. "com.apple.product-type.framework")
    pub kind: String,
    /// Folder the product is emitted into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_folder: Option<String>,
}

/// A single build-settings value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    String(String),
    List(Vec<String>),
}

impl SettingValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(s) => Some(s),
            SettingValue::List(_) => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        SettingValue::String(s.to_string())
    }
}

impl From<Vec<String>> for SettingValue {
    fn from(v: Vec<String>) -> Self {
        SettingValue::List(v)
    }
}

/// Build settings of one configuration, ordered by key.
pub type BuildSettings = BTreeMap<String, SettingValue>;

/// An opaque build phase (compile sources, link, copy resources, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPhase {
    /// Phase name
    pub name: String,
    /// Phase kind discriminator (e.g. "sources", "frameworks", "resources")
    pub kind: String,
    /// Input file references, in declared order
    #[serde(default)]
    pub files: Vec<String>,
}

impl BuildPhase {
    /// Whether this phase compiles sources (removed when a target is bound
    /// to a cached binary).
    pub fn is_compile(&self) -> bool {
        self.kind == "sources"
    }
}

/// A user-defined shell script phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPhase {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub input_paths: Vec<String>,
    #[serde(default)]
    pub output_paths: Vec<String>,
}

/// A custom build rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRule {
    pub name: String,
    /// File pattern or type the rule applies to
    pub file_type: String,
    /// Compiler spec or script body
    pub action: String,
}

/// A unit of compilation in the project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier
    pub id: TargetId,
    /// Target name as shown in the project
    pub name: String,
    /// Target kind
    pub kind: TargetKind,
    /// Product record, absent for aggregates and some utility targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
    /// Custom build rules, in declared order
    #[serde(default)]
    pub build_rules: Vec<BuildRule>,
    /// Per-configuration build settings
    #[serde(default)]
    pub configurations: BTreeMap<String, BuildSettings>,
    /// Build phases, in declared order
    #[serde(default)]
    pub build_phases: Vec<BuildPhase>,
    /// Script phases, in declared order
    #[serde(default)]
    pub script_phases: Vec<ScriptPhase>,
    /// Direct dependency edges only
    #[serde(default)]
    pub explicit_dependencies: BTreeSet<TargetId>,
    /// Source group references owned by this target
    #[serde(default)]
    pub source_groups: Vec<String>,

    /// Fingerprint digest, set once per run by the fingerprint engine
    #[serde(skip)]
    pub fingerprint: Option<String>,
    /// Canonical fingerprint pre-image, memoized alongside the digest
    #[serde(skip)]
    pub fingerprint_context: Option<String>,
}

impl Target {
    /// Create a target with the given id, name and kind; everything else
    /// starts empty.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            id: TargetId::new(id),
            name: name.into(),
            kind,
            product: None,
            build_rules: Vec::new(),
            configurations: BTreeMap::new(),
            build_phases: Vec::new(),
            script_phases: Vec::new(),
            explicit_dependencies: BTreeSet::new(),
            source_groups: Vec::new(),
            fingerprint: None,
            fingerprint_context: None,
        }
    }

    /// The product name used for store paths; falls back to the target name
    /// for targets without a product record.
    pub fn product_name(&self) -> &str {
        self.product.as_ref().map(|p| p.name.as_str()).unwrap_or(&self.name)
    }

    /// Whether the fingerprint engine has finalized this target.
    pub fn has_fingerprint(&self) -> bool {
        self.fingerprint.is_some() && self.fingerprint_context.is_some()
    }
}

/// Workspace-level metadata carried alongside the target arena.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceMeta {
    /// Workspace or project name
    pub name: String,
    /// On-disk project files the writer mutates; the journal snapshots these
    #[serde(default)]
    pub project_files: Vec<PathBuf>,
    /// Free-form marker map (patch sentinel lives here)
    #[serde(default)]
    pub markers: BTreeMap<String, String>,
}

/// Errors from graph operations
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error("duplicate target id: {0}")]
    DuplicateTarget(TargetId),
}

/// The project graph: target arena plus workspace metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectGraph {
    /// Workspace metadata
    pub workspace: WorkspaceMeta,
    /// Target arena, ordered by id
    targets: BTreeMap<TargetId, Target>,
    /// Memoized transitive closures, dropped by `reset_resolved`
    #[serde(skip)]
    resolved: BTreeMap<TargetId, BTreeSet<TargetId>>,
}

impl ProjectGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workspace: WorkspaceMeta {
                name: name.into(),
                ..Default::default()
            },
            targets: BTreeMap::new(),
            resolved: BTreeMap::new(),
        }
    }

    /// Insert a target; fails on duplicate id.
    pub fn insert(&mut self, target: Target) -> Result<(), GraphError> {
        if self.targets.contains_key(&target.id) {
            return Err(GraphError::DuplicateTarget(target.id));
        }
        self.targets.insert(target.id.clone(), target);
        Ok(())
    }

    /// Remove a target and every edge pointing at it.
    pub fn remove(&mut self, id: &TargetId) -> Option<Target> {
        let removed = self.targets.remove(id);
        if removed.is_some() {
            for target in self.targets.values_mut() {
                target.explicit_dependencies.remove(id);
            }
            self.resolved.clear();
        }
        removed
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.targets.contains_key(id)
    }

    pub fn target(&self, id: &TargetId) -> Result<&Target, GraphError> {
        self.targets.get(id).ok_or_else(|| GraphError::UnknownTarget(id.clone()))
    }

    pub fn target_mut(&mut self, id: &TargetId) -> Result<&mut Target, GraphError> {
        self.targets.get_mut(id).ok_or_else(|| GraphError::UnknownTarget(id.clone()))
    }

    /// All target ids in arena order.
    pub fn ids(&self) -> impl Iterator<Item = &TargetId> {
        self.targets.keys()
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// The transitive closure of `explicit_dependencies` for one target,
    /// memoized. Cycles are broken by the visited set; the closure always
    /// includes the direct dependencies and never the root itself (unless
    /// the root participates in a cycle reaching back to it).
    pub fn resolved_dependencies(
        &mut self,
        id: &TargetId,
    ) -> Result<BTreeSet<TargetId>, GraphError> {
        if let Some(cached) = self.resolved.get(id) {
            return Ok(cached.clone());
        }
        if !self.targets.contains_key(id) {
            return Err(GraphError::UnknownTarget(id.clone()));
        }

        let mut closure = BTreeSet::new();
        let mut stack: Vec<TargetId> = self
            .targets
            .get(id)
            .map(|t| t.explicit_dependencies.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(dep) = stack.pop() {
            if !closure.insert(dep.clone()) {
                continue;
            }
            if let Some(target) = self.targets.get(&dep) {
                for next in &target.explicit_dependencies {
                    if !closure.contains(next) {
                        stack.push(next.clone());
                    }
                }
            }
        }

        self.resolved.insert(id.clone(), closure.clone());
        Ok(closure)
    }

    /// The union of the roots and their transitive closures, in id order.
    pub fn closure_of(&mut self, roots: &BTreeSet<TargetId>) -> Result<BTreeSet<TargetId>, GraphError> {
        let mut all = BTreeSet::new();
        for root in roots {
            all.insert(root.clone());
            all.extend(self.resolved_dependencies(root)?);
        }
        Ok(all)
    }

    /// Drop memoized closures. Called after structural mutation.
    pub fn reset_resolved(&mut self) {
        self.resolved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_chain() -> ProjectGraph {
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

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut graph = ProjectGraph::new("Test");
        graph.insert(Target::new("A", "A", TargetKind::Framework)).unwrap();
        let result = graph.insert(Target::new("A", "A", TargetKind::Framework));
        assert!(matches!(result, Err(GraphError::DuplicateTarget(_))));
    }

    #[test]
    fn test_resolved_dependencies_transitive() {
        let mut graph = graph_with_chain();
        let closure = graph.resolved_dependencies(&"App".into()).unwrap();
        assert!(closure.contains(&TargetId::from("Feature")));
        assert!(closure.contains(&TargetId::from("Service")));
        assert!(!closure.contains(&TargetId::from("App")));
    }

    #[test]
    fn test_resolved_superset_of_explicit() {
        let mut graph = graph_with_chain();
        let explicit = graph
            .target(&"App".into())
            .unwrap()
            .explicit_dependencies
            .clone();
        let closure = graph.resolved_dependencies(&"App".into()).unwrap();
        assert!(closure.is_superset(&explicit));
    }

    #[test]
    fn test_resolved_dependencies_cycle_terminates() {
        let mut graph = ProjectGraph::new("Cyclic");
        let mut a = Target::new("A", "A", TargetKind::Framework);
        a.explicit_dependencies.insert("B".into());
        let mut b = Target::new("B", "B", TargetKind::Framework);
        b.explicit_dependencies.insert("A".into());
        graph.insert(a).unwrap();
        graph.insert(b).unwrap();

        let closure = graph.resolved_dependencies(&"A".into()).unwrap();
        // The cycle reaches back to the root
        assert!(closure.contains(&TargetId::from("A")));
        assert!(closure.contains(&TargetId::from("B")));
    }

    #[test]
    fn test_remove_drops_edges() {
        let mut graph = graph_with_chain();
        graph.remove(&"Service".into());
        let feature = graph.target(&"Feature".into()).unwrap();
        assert!(feature.explicit_dependencies.is_empty());
    }

    #[test]
    fn test_closure_of_multiple_roots() {
        let mut graph = graph_with_chain();
        let roots: BTreeSet<TargetId> = ["App".into(), "Service".into()].into();
        let all = graph.closure_of(&roots).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_product_name_fallback() {
        let mut t = Target::new("A", "SomeName", TargetKind::Framework);
        assert_eq!(t.product_name(), "SomeName");
        t.product = Some(Product {
            name: "SomeProduct".to_string(),
            module_name: None,
            kind: "com.apple.product-type.framework".to_string(),
            parent_folder: None,
        });
        assert_eq!(t.product_name(), "SomeProduct");
    }
}
