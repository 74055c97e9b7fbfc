//! Canonical fingerprint pre-image
//!
//! The pre-image is a textual document with a fixed key order and
//! deterministic quoting. Equal inputs must serialize to equal bytes on
//! every run and every machine; the document is the hashing contract, so
//! any format change invalidates every existing cache entry.

use std::collections::BTreeMap;

use crate::env::XcodeVersion;
use crate::hashers::ConfigurationHash;

/// All inputs folded into one target's fingerprint.
pub struct ContextInputs<'a> {
    pub name: &'a str,
    /// Product fields as `(key, value)` pairs, or `None` for product-less
    /// targets. Keys must already be in emit order.
    pub product: Option<Vec<(&'static str, Option<String>)>>,
    pub swift_version: &'a str,
    pub xcode_version: &'a XcodeVersion,
    pub xcargs: &'a [String],
    pub build_phases: Vec<String>,
    pub build_rules: Vec<String>,
    pub script_phases: Vec<String>,
    pub configurations: Vec<ConfigurationHash>,
    /// Direct dependency name → fingerprint contribution
    pub dependencies: BTreeMap<String, String>,
}

/// Serialize the inputs into the canonical document.
///
/// Top-level key order is fixed: buildOptions, buildPhases, buildRules,
/// scriptPhases, configurations, dependencies, name, product,
/// swift_version, xcode_version. Nested maps are ordered by key; nested
/// sequences keep their declared order.
pub fn render(inputs: &ContextInputs<'_>) -> String {
    let mut out = String::with_capacity(512);

    out.push_str("buildOptions:\n");
    if inputs.xcargs.is_empty() {
        out.push_str("  xcargs: []\n");
    } else {
        out.push_str("  xcargs:\n");
        for arg in inputs.xcargs {
            out.push_str("    - ");
            out.push_str(&scalar(arg));
            out.push('\n');
        }
    }

    string_list(&mut out, "buildPhases", &inputs.build_phases);
    string_list(&mut out, "buildRules", &inputs.build_rules);
    string_list(&mut out, "scriptPhases", &inputs.script_phases);

    if inputs.configurations.is_empty() {
        out.push_str("configurations: []\n");
    } else {
        out.push_str("configurations:\n");
        for record in &inputs.configurations {
            out.push_str("  - ");
            out.push_str(&scalar(&record.name));
            out.push_str(": ");
            out.push_str(&scalar(&record.hash));
            out.push('\n');
        }
    }

    if inputs.dependencies.is_empty() {
        out.push_str("dependencies: {}\n");
    } else {
        out.push_str("dependencies:\n");
        for (name, fingerprint) in &inputs.dependencies {
            out.push_str("  ");
            out.push_str(&scalar(name));
            out.push_str(": ");
            out.push_str(&scalar(fingerprint));
            out.push('\n');
        }
    }

    out.push_str("name: ");
    out.push_str(&scalar(inputs.name));
    out.push('\n');

    match &inputs.product {
        None => out.push_str("product: null\n"),
        Some(fields) => {
            out.push_str("product:\n");
            for (key, value) in fields {
                out.push_str("  ");
                out.push_str(key);
                out.push_str(": ");
                match value {
                    Some(v) => out.push_str(&scalar(v)),
                    None => out.push_str("null"),
                }
                out.push('\n');
            }
        }
    }

    out.push_str("swift_version: ");
    out.push_str(&scalar(inputs.swift_version));
    out.push('\n');

    out.push_str("xcode_version:\n  base: ");
    out.push_str(&scalar(&inputs.xcode_version.base));
    out.push_str("\n  build: ");
    out.push_str(&scalar(&inputs.xcode_version.build));
    out.push('\n');

    out
}

fn string_list(out: &mut String, key: &str, items: &[String]) {
    if items.is_empty() {
        out.push_str(key);
        out.push_str(": []\n");
        return;
    }
    out.push_str(key);
    out.push_str(":\n");
    for item in items {
        out.push_str("  - ");
        out.push_str(&scalar(item));
        out.push('\n');
    }
}

/// Quote a scalar only when necessary.
fn scalar(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || s.starts_with(['-', '[', '{', ' '])
        || s.ends_with(' ')
        || s.contains([':', '#', '"', '\n', '\\']);
    if !needs_quotes {
        return s.to_string();
    }
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}
