// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::descriptor::WorkloadDescriptor;
use anyhow::{Context, Result};
use std::collections::BTreeMap;

/// Variable carrying the assigned port to the workload.
pub const PORT_VAR: &str = "PORT";

/// Read an `environment_file`: one `KEY=VALUE` per line, optionally prefixed
/// with `export` and optionally quoted. `#` comments, blank lines and lines
/// without `=` are ignored.
pub fn read_env_file(path: &str) -> Result<Vec<(String, String)>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("cannot read env file {path}"))?;
    Ok(text.lines().filter_map(env_assignment).collect())
}

fn env_assignment(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then(|| (key.to_string(), unquote(value.trim()).to_string()))
}

/// Strip one matching pair of surrounding `"` or `'`.
fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|q| value.strip_prefix(q)?.strip_suffix(q))
        .unwrap_or(value)
}

/// Compose the environment a workload is launched with. Later layers win:
/// parent environment (when inherited), `environment_file`, `env`, then `PORT`.
pub fn workload_environment(descriptor: &WorkloadDescriptor) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    if descriptor.inherit_env {
        vars.extend(std::env::vars());
    }
    if let Some(ref path) = descriptor.environment_file {
        vars.extend(read_env_file(path)?);
    }
    vars.extend(
        descriptor
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    vars.insert(PORT_VAR.to_string(), descriptor.port.to_string());
    Ok(vars)
}
