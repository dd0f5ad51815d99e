//! Per-route command validation.
//!
//! `validate` runs before any process is spawned or any network call is
//! made, on both the client and the server side of remote execution. It
//! fails closed: an unknown route, an unknown option key or a value outside
//! the allowed set is a rejection, never a pass-by-default.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::boxed::{BoxedCommand, BoxedPath};
use crate::command::Command;
use crate::error::{Result, RunboxError};
use crate::syntax::{self, ShellFeature};

/// What one route is allowed to do. Every field is optional; a check is
/// applied only when its field is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutePolicy {
    /// Allowed input file names.
    pub input_files: Option<BTreeSet<String>>,
    /// Allowed output file names.
    pub output_files: Option<BTreeSet<String>>,
    /// Allowed glob patterns, in `prefix*.ext` notation.
    pub output_globs: Option<BTreeSet<String>>,
    /// Shell features the command string may use.
    pub shell_features: Option<BTreeSet<ShellFeature>>,
    /// Positional rules the literal argv must match exactly.
    pub argv: Option<Vec<ArgRule>>,
    /// Per-key rules for scalar options; any option not named here is
    /// rejected.
    pub options: Option<BTreeMap<String, ArgRule>>,
}

/// One value rule: either an exact string or a typed constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgRule {
    Exact(String),
    Typed { allow: Constraint },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Constraint {
    /// Anything, including the empty string.
    Any,
    /// Any present value.
    Literal,
    Float,
    Integer,
    /// A path that normalizes underneath the working directory.
    RelativePath,
}

impl ArgRule {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(expected) => value == expected,
            Self::Typed { allow } => match allow {
                Constraint::Any | Constraint::Literal => true,
                Constraint::Float => value.parse::<f64>().is_ok(),
                Constraint::Integer => value.parse::<i64>().is_ok(),
                Constraint::RelativePath => BoxedPath::new(value).is_ok(),
            },
        }
    }
}

/// Option keys the scalar-option check recognizes. A policy naming any
/// other key (environment aside) is itself invalid.
const KNOWN_OPTION_KEYS: &[&str] = &[
    "cpu-limit",
    "wall-limit",
    "memory-limit",
    "file-size-limit",
    "stdin",
    "disable-network",
    "disabled-syscalls",
    "no-new-privileges",
    "private-namespace",
    "private-dev",
    "disable-sandbox",
];

/// Check a boxed command against the per-route policies.
pub fn validate(command: &BoxedCommand, routes: &BTreeMap<String, RoutePolicy>) -> Result<()> {
    let route = command.route();
    let policy = routes.get(route).ok_or_else(|| RunboxError::RouteNotAllowed {
        route: route.to_string(),
    })?;

    let reject = |reason: String| {
        Err(RunboxError::Validation {
            route: route.to_string(),
            reason,
        })
    };

    if let Some(allowed) = &policy.input_files {
        for path in command.inputs().keys() {
            if !allowed.contains(path.as_str()) {
                return reject(format!("input file '{}' is not allowed", path));
            }
        }
    }

    if let Some(allowed) = &policy.output_files {
        for path in command.outputs().keys() {
            if !allowed.contains(path.as_str()) {
                return reject(format!("output file '{}' is not allowed", path));
            }
        }
    }

    if let Some(allowed) = &policy.output_globs {
        for glob in command.globs().values() {
            if !allowed.contains(&glob.pattern()) {
                return reject(format!("output glob '{}' is not allowed", glob.pattern()));
            }
        }
    }

    // Parsed once per call and threaded through the remaining checks.
    let info = syntax::parse(command.command.text());

    if let Some(allowed) = &policy.shell_features {
        for feature in &info.features {
            if !allowed.contains(feature) {
                return reject(format!("shell feature '{}' is not allowed", feature.as_str()));
            }
        }
    }

    if let Some(rules) = &policy.argv {
        let Some(argv) = &info.literal_argv else {
            return reject("argv rules require a literal command".to_string());
        };
        if argv.len() != rules.len() {
            return reject(format!(
                "argv has {} words, policy expects {}",
                argv.len(),
                rules.len()
            ));
        }
        for (index, (word, rule)) in argv.iter().zip(rules).enumerate() {
            if !rule.matches(word) {
                return reject(format!("argv word {} ('{}') is not allowed", index, word));
            }
        }
    }

    if let Some(rules) = &policy.options {
        for key in rules.keys() {
            if !KNOWN_OPTION_KEYS.contains(&key.as_str()) && !key.starts_with("env.") {
                return reject(format!("policy names unknown option '{}'", key));
            }
        }
        for (key, value) in scalar_options(&command.command) {
            let Some(rule) = rules.get(&key) else {
                return reject(format!("option '{}' is not allowed", key));
            };
            if !rule.matches(&value) {
                return reject(format!("option '{}' value '{}' is not allowed", key, value));
            }
        }
    }

    Ok(())
}

/// Flatten a command's non-file scalar options into one string map, the
/// shape the per-key rules are written against.
fn scalar_options(command: &Command) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        options.insert(key.to_string(), value);
    };

    if let Some(cpu) = command.cpu_limit {
        set("cpu-limit", cpu.to_string());
    }
    if let Some(wall) = command.wall_limit {
        set("wall-limit", wall.to_string());
    }
    if let Some(mem) = command.memory_limit {
        set("memory-limit", mem.to_string());
    }
    if let Some(fsize) = command.file_size_limit {
        set("file-size-limit", fsize.to_string());
    }
    if command.stdin.is_some() {
        set("stdin", "true".to_string());
    }
    if command.disable_network {
        set("disable-network", "true".to_string());
    }
    if !command.disabled_syscalls.is_empty() {
        set("disabled-syscalls", command.disabled_syscalls.join(","));
    }
    if command.no_new_privs {
        set("no-new-privileges", "true".to_string());
    }
    if command.private_namespace {
        set("private-namespace", "true".to_string());
    }
    if command.private_dev {
        set("private-dev", "true".to_string());
    }
    if command.disable_sandbox {
        set("disable-sandbox", "true".to_string());
    }
    for (key, value) in &command.env {
        options.insert(format!("env.{}", key), value.clone());
    }

    options
}
