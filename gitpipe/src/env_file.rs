//! Environment file parsing and per-workload variable filtering.
//!
//! Files use `KEY=VALUE` lines; blank lines and `#` comments are skipped.
//! When several files are merged, later files win. Workloads only receive
//! variables carrying their own prefix (`MY_APP_` for a workload named
//! `my-app`), with the prefix stripped.

use std::collections::HashMap;
use std::path::Path;

/// Parses a single `KEY=VALUE` environment file.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be read.
pub fn read_env_file(path: impl AsRef<Path>) -> std::io::Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_env(&content))
}

/// Parses `KEY=VALUE` lines from `content`.
pub fn parse_env(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        vars.insert(key.trim().to_string(), value.trim().to_string());
    }
    vars
}

/// Reads and merges several env files; later files overwrite earlier.
///
/// The system environment is deliberately not overlaid here: workloads see
/// only what the operator put in the files.
pub fn merge_env_files<P: AsRef<Path>>(
    paths: &[P],
) -> std::io::Result<HashMap<String, String>> {
    let mut merged = HashMap::new();
    for path in paths {
        merged.extend(read_env_file(path)?);
    }
    Ok(merged)
}

/// Returns the variable prefix for a workload name: upper-cased with `-`
/// replaced by `_`, followed by `_`.
pub fn workload_prefix(name: &str) -> String {
    let mut prefix = name.to_uppercase().replace('-', "_");
    prefix.push('_');
    prefix
}

/// Extracts the variables addressed to `name`, stripping the prefix.
pub fn filter_for_workload(
    vars: &HashMap<String, String>,
    name: &str,
) -> HashMap<String, String> {
    let prefix = workload_prefix(name);
    vars.iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}
