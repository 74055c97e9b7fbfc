//! Target selection
//!
//! Workflows operate on the subset of targets matched by the user's
//! include/except regex filters, intersected with the cacheable kinds.
//! Applications and test bundles are excluded unless a workflow asks for
//! them, and names carrying the development-pods marker are always denied.

use std::collections::BTreeSet;

use regex::Regex;
use thiserror::Error;

use crate::graph::{ProjectGraph, TargetId, TargetKind};

/// Substring that marks a target as a local development module, never
/// bound to cached binaries.
pub const DENY_MARKER: &str = "dev_modules";

/// Errors from building a selector
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("invalid selection pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Deterministic target selection filter.
#[derive(Debug, Default)]
pub struct TargetSelector {
    include: Option<Regex>,
    except: Option<Regex>,
    except_names: BTreeSet<String>,
    include_tests: bool,
    include_apps: bool,
}

impl TargetSelector {
    /// Select every cacheable target.
    pub fn all() -> Self {
        Self::default()
    }

    /// Keep only targets whose name matches the pattern.
    pub fn with_include(mut self, pattern: &str) -> Result<Self, SelectionError> {
        self.include = Some(compile(pattern)?);
        Ok(self)
    }

    /// Drop targets whose name matches the pattern.
    pub fn with_except(mut self, pattern: &str) -> Result<Self, SelectionError> {
        self.except = Some(compile(pattern)?);
        Ok(self)
    }

    /// Drop targets whose name equals one of the given names,
    /// case-insensitively. Used by the local-changes workflow to keep
    /// touched packages as source.
    pub fn with_except_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.except_names
            .extend(names.into_iter().map(|n| n.to_lowercase()));
        self
    }

    /// Also select test bundles.
    pub fn with_tests(mut self) -> Self {
        self.include_tests = true;
        self
    }

    /// Also select applications.
    pub fn with_apps(mut self) -> Self {
        self.include_apps = true;
        self
    }

    fn kind_allowed(&self, kind: TargetKind) -> bool {
        kind.is_cacheable()
            || (self.include_tests && kind == TargetKind::Tests)
            || (self.include_apps && kind == TargetKind::Application)
    }

    /// Apply the filter to a graph.
    pub fn select(&self, graph: &ProjectGraph) -> BTreeSet<TargetId> {
        graph
            .targets()
            .filter(|target| self.kind_allowed(target.kind))
            .filter(|target| !target.name.contains(DENY_MARKER))
            .filter(|target| {
                self.include
                    .as_ref()
                    .map(|re| re.is_match(&target.name))
                    .unwrap_or(true)
            })
            .filter(|target| {
                !self
                    .except
                    .as_ref()
                    .map(|re| re.is_match(&target.name))
                    .unwrap_or(false)
            })
            .filter(|target| !self.except_names.contains(&target.name.to_lowercase()))
            .map(|target| target.id.clone())
            .collect()
    }
}

fn compile(pattern: &str) -> Result<Regex, SelectionError> {
    Regex::new(pattern).map_err(|source| SelectionError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
