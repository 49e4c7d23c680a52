// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{OutputMode, WorkloadConfig};
use crate::restart::{
    DEFAULT_RESTART_DELAY, DEFAULT_RESTART_MAX_ATTEMPTS, DEFAULT_RESTART_MAX_DELAY, RestartPolicy,
};
use anyhow::{Result, bail};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Immutable definition of how to launch and reach a workload.
#[derive(Debug, Clone)]
pub struct WorkloadDescriptor {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub environment_file: Option<String>,
    pub inherit_env: bool,
    pub working_dir: Option<PathBuf>,
    pub port: u16,
    pub health_path: String,
    pub route: String,
    pub strip_prefix: bool,
    pub restart: RestartPolicy,
    pub stop_timeout: Option<Duration>,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
    pub auto_start: bool,
    pub condition_path_exists: Option<PathBuf>,
}

impl WorkloadDescriptor {
    pub fn from_config(name: &str, config: WorkloadConfig) -> Result<Self> {
        if name.is_empty() {
            bail!("workload name is empty");
        }
        if config.command.trim().is_empty() {
            bail!("command is empty");
        }
        if config.port == 0 {
            bail!("port must be non-zero");
        }
        if !config.health_path.starts_with('/') {
            bail!("health_path must start with '/': {}", config.health_path);
        }
        let route = match config.route {
            Some(route) => normalize_prefix(&route)?,
            None => normalize_prefix(&format!("/{name}"))?,
        };

        let restart = RestartPolicy {
            mode: config.restart,
            initial_delay: seconds_or(config.restart_sec, DEFAULT_RESTART_DELAY)?,
            max_delay: seconds_or(config.restart_max_sec, DEFAULT_RESTART_MAX_DELAY)?,
            max_attempts: config
                .restart_max_attempts
                .unwrap_or(DEFAULT_RESTART_MAX_ATTEMPTS),
        };

        Ok(Self {
            name: name.to_string(),
            command: config.command,
            args: config.args,
            env: config.env,
            environment_file: config.environment_file,
            inherit_env: config.inherit_env,
            working_dir: config.working_dir.map(PathBuf::from),
            port: config.port,
            health_path: config.health_path,
            route,
            strip_prefix: config.strip_prefix,
            restart,
            stop_timeout: config.stop_timeout.map(Duration::from_secs),
            stdout: config.stdout,
            stderr: config.stderr,
            auto_start: config.auto_start,
            condition_path_exists: config.condition_path_exists.map(PathBuf::from),
        })
    }

    /// Local address the workload is expected to listen on.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    /// Arguments with `{port}` replaced by the assigned port.
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }

    /// Check `auto_start` and `condition_path_exists`; false means do not launch.
    pub fn should_start(&self) -> bool {
        if !self.auto_start {
            info!("[{}] auto_start=false, skipping", self.name);
            return false;
        }
        if let Some(ref path) = self.condition_path_exists
            && !path.exists()
        {
            info!(
                "[{}] condition_path_exists not met: {}",
                self.name,
                path.display()
            );
            return false;
        }
        true
    }
}

fn seconds_or(value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(secs) => match Duration::try_from_secs_f64(secs) {
            Ok(d) => Ok(d),
            Err(_) => bail!("invalid duration: {secs}"),
        },
    }
}

/// Route prefixes start with `/` and carry no trailing slash, except `/` itself.
pub fn normalize_prefix(prefix: &str) -> Result<String> {
    let trimmed = prefix.trim();
    if !trimmed.starts_with('/') {
        bail!("route must start with '/': {prefix}");
    }
    if trimmed.contains(['?', '#', ' ']) {
        bail!("route must be a plain path: {prefix}");
    }
    let normalized = trimmed.trim_end_matches('/');
    if normalized.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(normalized.to_string())
    }
}

/// Registered descriptors, keyed by name. Names, ports and routes are unique.
#[derive(Debug, Default, Clone)]
pub struct DescriptorStore {
    descriptors: BTreeMap<String, Arc<WorkloadDescriptor>>,
}

impl DescriptorStore {
    /// Build the store from loaded configs, skipping (and logging) invalid or
    /// conflicting entries. Earlier entries win conflicts.
    pub fn from_configs(configs: Vec<(String, WorkloadConfig)>) -> Self {
        let mut store = Self::default();
        for (name, config) in configs {
            match WorkloadDescriptor::from_config(&name, config) {
                Ok(descriptor) => {
                    if let Err(e) = store.register(descriptor) {
                        warn!("[{name}] rejected: {e:#}");
                    }
                }
                Err(e) => warn!("[{name}] invalid descriptor: {e:#}"),
            }
        }
        store
    }

    pub fn register(&mut self, descriptor: WorkloadDescriptor) -> Result<()> {
        if self.descriptors.contains_key(&descriptor.name) {
            bail!("duplicate workload name {}", descriptor.name);
        }
        if let Some(other) = self.descriptors.values().find(|d| d.port == descriptor.port) {
            bail!("port {} already assigned to {}", descriptor.port, other.name);
        }
        if let Some(other) = self
            .descriptors
            .values()
            .find(|d| d.route == descriptor.route)
        {
            bail!("route {} already assigned to {}", descriptor.route, other.name);
        }
        self.descriptors
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorkloadDescriptor>> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
