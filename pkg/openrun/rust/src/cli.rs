// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{DEFAULT_CONFIG_DIR, DEFAULT_LISTEN_ADDR, SupervisorSettings};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Supervise local web workloads and route requests to them by path prefix
#[derive(Parser, Debug, Clone)]
#[command(name = "openrun-supd", version)]
pub struct Args {
    /// Directory of per-workload YAML descriptors
    #[arg(long, env = "OPENRUN_CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Address the router listens on
    #[arg(long, env = "OPENRUN_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "OPENRUN_LOG_LEVEL", default_value = "info")]
    pub log_level: log::Level,

    /// Interval between health probes of one workload
    #[arg(long, env = "OPENRUN_PROBE_INTERVAL_MS", default_value = "5000")]
    pub probe_interval_ms: u64,

    /// Timeout of a single health probe
    #[arg(long, env = "OPENRUN_PROBE_TIMEOUT_MS", default_value = "2000")]
    pub probe_timeout_ms: u64,

    /// Delay between launch and the first probe
    #[arg(long, env = "OPENRUN_INITIAL_PROBE_DELAY_MS", default_value = "1000")]
    pub initial_probe_delay_ms: u64,

    /// Consecutive failed probes before a workload is marked down
    #[arg(long, env = "OPENRUN_FAILURE_THRESHOLD", default_value = "3")]
    pub failure_threshold: u32,

    /// Failed probes are ignored this long after launch while starting
    #[arg(long, env = "OPENRUN_START_PERIOD_MS", default_value = "30000")]
    pub start_period_ms: u64,

    /// Grace period between SIGTERM and SIGKILL for workloads without `stop_timeout`
    #[arg(long, env = "OPENRUN_STOP_TIMEOUT_MS", default_value = "10000")]
    pub stop_timeout_ms: u64,

    /// Upper bound on the wait for a backend's response headers
    #[arg(long, env = "OPENRUN_REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,
}

impl Args {
    pub fn settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            initial_probe_delay: Duration::from_millis(self.initial_probe_delay_ms),
            failure_threshold: self.failure_threshold,
            start_period: Duration::from_millis(self.start_period_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
