// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::descriptor::WorkloadDescriptor;
use crate::health::{HealthTracker, MonitorHandle};
use crate::process::InstanceHandle;
use crate::restart::Backoff;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadState {
    /// Registered, never launched.
    Pending,
    /// Process launched, not yet reported healthy.
    Starting,
    /// Healthy and routable.
    Up,
    /// Failed health checks or exited; awaiting recovery or restart.
    Down,
    /// Explicitly stopped by the supervisor.
    Stopped,
    /// Restart policy gave up.
    PermanentlyFailed,
}

impl WorkloadState {
    pub fn is_routable(self) -> bool {
        self == WorkloadState::Up
    }

    pub(crate) fn can_transition_to(self, next: WorkloadState) -> bool {
        use WorkloadState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Down)
                | (Pending, Stopped)
                | (Pending, PermanentlyFailed)
                | (Starting, Up)
                | (Starting, Down)
                | (Starting, Stopped)
                | (Up, Down)
                | (Up, Stopped)
                | (Down, Up)
                | (Down, Starting)
                | (Down, Stopped)
                | (Down, PermanentlyFailed)
        )
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadState::Pending => write!(f, "pending"),
            WorkloadState::Starting => write!(f, "starting"),
            WorkloadState::Up => write!(f, "up"),
            WorkloadState::Down => write!(f, "down"),
            WorkloadState::Stopped => write!(f, "stopped"),
            WorkloadState::PermanentlyFailed => write!(f, "permanently-failed"),
        }
    }
}

/// Live record of a workload. Owned and mutated by the supervisor only.
pub struct WorkloadInstance {
    pub descriptor: Arc<WorkloadDescriptor>,
    pub state: WorkloadState,
    pub handle: Option<InstanceHandle>,
    pub monitor: Option<MonitorHandle>,
    pub health: HealthTracker,
    pub backoff: Backoff,
    /// Bumped on every launch; events from older processes are dropped.
    pub generation: u64,
    /// Bumped whenever a pending restart is scheduled or cancelled.
    pub restart_ticket: u64,
    pub restart_pending: bool,
    /// Relaunch as soon as the current process has exited.
    pub relaunch_on_exit: bool,
    pub restarts: u32,
    pub launched_at: Option<Instant>,
    pub last_probe: Option<SystemTime>,
}

impl WorkloadInstance {
    pub fn new(descriptor: Arc<WorkloadDescriptor>, failure_threshold: u32) -> Self {
        let backoff = Backoff::new(&descriptor.restart);
        Self {
            descriptor,
            state: WorkloadState::Pending,
            handle: None,
            monitor: None,
            health: HealthTracker::new(failure_threshold),
            backoff,
            generation: 0,
            restart_ticket: 0,
            restart_pending: false,
            relaunch_on_exit: false,
            restarts: 0,
            launched_at: None,
            last_probe: None,
        }
    }

    pub fn status(&self) -> WorkloadStatus {
        WorkloadStatus {
            name: self.descriptor.name.clone(),
            state: self.state,
            pid: self.handle.as_ref().map(InstanceHandle::pid),
            port: self.descriptor.port,
            route: self.descriptor.route.clone(),
            generation: self.generation,
            restarts: self.restarts,
            consecutive_failures: self.health.consecutive_failures(),
            last_probe_unix_ms: self
                .last_probe
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64),
        }
    }
}

/// Serializable view of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadStatus {
    pub name: String,
    pub state: WorkloadState,
    pub pid: Option<u32>,
    pub port: u16,
    pub route: String,
    pub generation: u64,
    pub restarts: u32,
    pub consecutive_failures: u32,
    pub last_probe_unix_ms: Option<u64>,
}

/// Status of every registered workload, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub workloads: Vec<WorkloadStatus>,
}

impl StatusSnapshot {
    pub fn get(&self, name: &str) -> Option<&WorkloadStatus> {
        self.workloads.iter().find(|w| w.name == name)
    }
}
