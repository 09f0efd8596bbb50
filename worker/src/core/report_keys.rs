//! Report key extraction from nested evaluation results.
//!
//! A report key is a colon-separated path into a nested JSON object, one key
//! per level (`metrics:accuracy` names `results["metrics"]["accuracy"]`).
//! Callers select keys with regular expressions that must match a whole path.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Separator between path segments.
pub const PATH_SEPARATOR: char = ':';

/// Errors raised to the caller of the matcher. Never persisted.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("report key pattern {0:?} matched no result key")]
    BadKey(String),

    #[error("optimize key pattern {pattern:?} matched more than one result key: {matches:?}")]
    AmbiguousKey {
        pattern: String,
        matches: Vec<String>,
    },

    #[error("result key {0:?} not found")]
    KeyNotFound(String),

    #[error("invalid key pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Metrics selected out of a full result structure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredResults {
    /// Every path selected by the report patterns, plus the optimize key.
    pub report: BTreeMap<String, Value>,
    /// The single optimize entry, or empty when no optimize pattern was given.
    pub optimize: BTreeMap<String, Value>,
}

impl FilteredResults {
    /// The resolved optimize key and value, if any.
    pub fn optimize_entry(&self) -> Option<(&String, &Value)> {
        self.optimize.iter().next()
    }
}

/// Collect the addressable path of every leaf value in `results`.
pub fn flatten_keys(results: &Value) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    if let Value::Object(map) = results {
        append_keys(&mut keys, "", map);
    }
    keys
}

fn append_keys(keys: &mut BTreeSet<String>, prefix: &str, map: &serde_json::Map<String, Value>) {
    for (key, value) in map {
        match value {
            Value::Object(nested) => {
                let nested_prefix = format!("{prefix}{key}{PATH_SEPARATOR}");
                append_keys(keys, &nested_prefix, nested);
            }
            _ => {
                keys.insert(format!("{prefix}{key}"));
            }
        }
    }
}

/// Match each pattern, in order, against every path.
///
/// Matches are appended in path order. A path matched by two patterns appears
/// twice.
pub fn match_patterns<P: AsRef<str>>(
    patterns: &[P],
    all_paths: &BTreeSet<String>,
) -> Result<Vec<String>, KeyError> {
    let mut matching = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let re = compile_anchored(pattern)?;
        let before = matching.len();
        matching.extend(all_paths.iter().filter(|path| re.is_match(path)).cloned());
        if matching.len() == before {
            return Err(KeyError::BadKey(pattern.to_string()));
        }
    }
    Ok(matching)
}

/// Resolve a pattern that must name exactly one path.
pub fn resolve_optimize_key(pattern: &str, all_paths: &BTreeSet<String>) -> Result<String, KeyError> {
    let mut matches = match_patterns(&[pattern], all_paths)?;
    match matches.len() {
        0 => Err(KeyError::BadKey(pattern.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(KeyError::AmbiguousKey {
            pattern: pattern.to_string(),
            matches,
        }),
    }
}

/// Look up the value addressed by a colon-separated path.
pub fn get_by_path<'a>(path: &str, results: &'a Value) -> Result<&'a Value, KeyError> {
    path.split(PATH_SEPARATOR)
        .try_fold(results, |current, segment| current.get(segment))
        .ok_or_else(|| KeyError::KeyNotFound(path.to_string()))
}

/// Select the report metrics and the optimize metric out of `all_results`.
pub fn filter_results<P: AsRef<str>>(
    all_results: &Value,
    report_patterns: &[P],
    optimize_pattern: Option<&str>,
) -> Result<FilteredResults, KeyError> {
    let all_paths = flatten_keys(all_results);

    let mut filtered = FilteredResults::default();
    for path in match_patterns(report_patterns, &all_paths)? {
        let value = get_by_path(&path, all_results)?.clone();
        filtered.report.insert(path, value);
    }

    if let Some(pattern) = optimize_pattern {
        let path = resolve_optimize_key(pattern, &all_paths)?;
        let value = get_by_path(&path, all_results)?.clone();
        filtered.report.insert(path.clone(), value.clone());
        filtered.optimize.insert(path, value);
    }

    Ok(filtered)
}

/// Full-string match, not a prefix match.
fn compile_anchored(pattern: &str) -> Result<Regex, KeyError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| KeyError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
