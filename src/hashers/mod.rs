//! Subhasher collaborators
//!
//! The fingerprint engine does not inspect build phases, rules, scripts or
//! configurations itself; it folds in opaque hash strings produced by the
//! subhashers here. Each subhasher is a trait so project-format quirks stay
//! out of the engine, with SHA-256 content hashers as the defaults.
//!
//! The configurations hasher excludes every setting key known to carry
//! absolute filesystem paths. Identical projects checked out at different
//! locations (different CI workers) must hash identically.

use sha2::{Digest, Sha256};

use crate::env::CollaboratorResult;
use crate::graph::{BuildPhase, BuildRule, BuildSettings, ScriptPhase, SettingValue};

/// Setting keys whose values carry absolute paths. Never folded into a
/// configuration hash.
pub const PATH_VALUED_KEYS: &[&str] = &[
    "BUILT_PRODUCTS_DIR",
    "CONFIGURATION_BUILD_DIR",
    "CONFIGURATION_TEMP_DIR",
    "DSTROOT",
    "FRAMEWORK_SEARCH_PATHS",
    "HEADER_SEARCH_PATHS",
    "LIBRARY_SEARCH_PATHS",
    "OBJROOT",
    "PODS_BUILD_DIR",
    "PODS_CONFIGURATION_BUILD_DIR",
    "PODS_ROOT",
    "SHARED_PRECOMPS_DIR",
    "SRCROOT",
    "SYMROOT",
];

/// SHA-256 over newline-joined parts, hex encoded.
pub fn sha256_hex<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Hashes one build phase into an opaque string.
pub trait BuildPhaseHasher: Send + Sync {
    fn hash_phase(&self, phase: &BuildPhase) -> CollaboratorResult<String>;
}

/// Hashes one build rule into an opaque string.
pub trait BuildRulesHasher: Send + Sync {
    fn hash_rule(&self, rule: &BuildRule) -> CollaboratorResult<String>;
}

/// Hashes one script phase into an opaque string.
pub trait ScriptsHasher: Send + Sync {
    fn hash_script(&self, script: &ScriptPhase) -> CollaboratorResult<String>;
}

/// One configuration's hash record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationHash {
    /// Configuration name (e.g. "Debug")
    pub name: String,
    /// Opaque hash of the path-free settings
    pub hash: String,
}

/// Hashes one configuration's settings into an opaque record.
pub trait ConfigurationsHasher: Send + Sync {
    fn hash_configuration(
        &self,
        name: &str,
        settings: &BuildSettings,
    ) -> CollaboratorResult<ConfigurationHash>;
}

/// Default SHA-256 content hashers for all four subdomains.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHashers;

impl BuildPhaseHasher for ContentHashers {
    fn hash_phase(&self, phase: &BuildPhase) -> CollaboratorResult<String> {
        let mut parts = vec![phase.kind.as_str(), phase.name.as_str()];
        parts.extend(phase.files.iter().map(String::as_str));
        Ok(sha256_hex(parts))
    }
}

impl BuildRulesHasher for ContentHashers {
    fn hash_rule(&self, rule: &BuildRule) -> CollaboratorResult<String> {
        Ok(sha256_hex([
            rule.name.as_str(),
            rule.file_type.as_str(),
            rule.action.as_str(),
        ]))
    }
}

impl ScriptsHasher for ContentHashers {
    fn hash_script(&self, script: &ScriptPhase) -> CollaboratorResult<String> {
        let mut parts = vec![script.name.as_str(), script.script.as_str()];
        parts.extend(script.input_paths.iter().map(String::as_str));
        parts.extend(script.output_paths.iter().map(String::as_str));
        Ok(sha256_hex(parts))
    }
}

impl ConfigurationsHasher for ContentHashers {
    fn hash_configuration(
        &self,
        name: &str,
        settings: &BuildSettings,
    ) -> CollaboratorResult<ConfigurationHash> {
        let mut lines: Vec<String> = Vec::with_capacity(settings.len() + 1);
        lines.push(name.to_string());
        for (key, value) in settings {
            if PATH_VALUED_KEYS.contains(&key.as_str()) {
                continue;
            }
            match value {
                SettingValue::String(s) => lines.push(format!("{key}={s}")),
                SettingValue::List(items) => lines.push(format!("{key}={}", items.join("|"))),
            }
        }
        Ok(ConfigurationHash {
            name: name.to_string(),
            hash: sha256_hex(lines.iter().map(String::as_str)),
        })
    }
}

/// The full subhasher bundle handed to the fingerprint engine.
pub struct Subhashers {
    pub phases: Box<dyn BuildPhaseHasher>,
    pub rules: Box<dyn BuildRulesHasher>,
    pub scripts: Box<dyn ScriptsHasher>,
    pub configurations: Box<dyn ConfigurationsHasher>,
}

impl Default for Subhashers {
    fn default() -> Self {
        Self {
            phases: Box::new(ContentHashers),
            rules: Box::new(ContentHashers),
            scripts: Box::new(ContentHashers),
            configurations: Box::new(ContentHashers),
        }
    }
}
