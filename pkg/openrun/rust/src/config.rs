// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/openrun/apps.d";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_HEALTH_PATH: &str = "/health";

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

/// Where a workload's stdout/stderr end up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Forward each line to the supervisor log, prefixed with the workload name.
    #[default]
    Log,
    Inherit,
    Null,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    Never,
    #[default]
    Always,
    OnFailure,
}

/// On-disk form of a workload, one YAML file per workload.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub environment_file: Option<String>,
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    pub working_dir: Option<String>,
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// External path prefix; defaults to `/<name>`.
    pub route: Option<String>,
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
    #[serde(default)]
    pub restart: RestartMode,
    pub restart_sec: Option<f64>,
    pub restart_max_sec: Option<f64>,
    pub restart_max_attempts: Option<u32>,
    pub stop_timeout: Option<u64>,
    #[serde(default)]
    pub stdout: OutputMode,
    #[serde(default)]
    pub stderr: OutputMode,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    pub condition_path_exists: Option<String>,
}

/// Daemon-wide knobs, filled from the command line.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub initial_probe_delay: Duration,
    pub failure_threshold: u32,
    pub start_period: Duration,
    /// Grace period for workloads that do not set `stop_timeout`.
    pub stop_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            initial_probe_delay: Duration::from_secs(1),
            failure_threshold: 3,
            start_period: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Read every `*.yaml`/`*.yml` descriptor in `dir`, ordered by file name.
///
/// The file stem becomes the workload name. A file that cannot be read or
/// parsed is logged and left out; only an unreadable directory is an error.
pub fn load_configs(dir: &Path) -> Result<Vec<(String, WorkloadConfig)>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("cannot list config directory {}", dir.display()))?
    {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(e) => warn!("ignoring entry in {}: {e}", dir.display()),
        }
    }
    paths.sort();

    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(name) = workload_name(&path) else {
            continue;
        };
        match parse_config(&path) {
            Ok(config) => configs.push((name.to_string(), config)),
            Err(e) => warn!("ignoring descriptor {}: {e:#}", path.display()),
        }
    }
    Ok(configs)
}

/// Workload name for a descriptor file, or `None` when `path` is not one.
fn workload_name(path: &Path) -> Option<&str> {
    if !matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
        debug!("not a descriptor: {}", path.display());
        return None;
    }
    let name = path.file_stem().and_then(|s| s.to_str());
    if name.is_none() {
        warn!("ignoring {}: file name is not valid UTF-8", path.display());
    }
    name
}

fn parse_config(path: &Path) -> Result<WorkloadConfig> {
    let raw = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&raw).context("invalid descriptor")
}
