// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::ShutdownTimeoutError;
use crate::process::{self, InstanceHandle, StopOutcome};
use log::{info, warn};
use std::time::Duration;
use tokio::task::JoinSet;

/// Stop every handle concurrently, each with its own grace period.
/// Returns the outcome per workload, sorted by name.
pub async fn shutdown_all(handles: Vec<(InstanceHandle, Duration)>) -> Vec<(String, StopOutcome)> {
    let mut set = JoinSet::new();
    for (mut handle, grace) in handles {
        set.spawn(async move {
            let outcome = process::stop(&mut handle, grace).await;
            (handle.workload().to_string(), outcome)
        });
    }

    let mut outcomes = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => outcomes.push(result),
            Err(e) => warn!("stop task failed: {e}"),
        }
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    outcomes
}

/// Summarize stop outcomes: `Err` lists the workloads that needed SIGKILL.
pub fn check_outcomes(outcomes: &[(String, StopOutcome)]) -> Result<(), ShutdownTimeoutError> {
    let killed: Vec<String> = outcomes
        .iter()
        .filter(|(_, outcome)| !outcome.is_clean())
        .map(|(name, _)| name.clone())
        .collect();
    if killed.is_empty() {
        info!("all workloads stopped cleanly");
        Ok(())
    } else {
        Err(ShutdownTimeoutError { workloads: killed })
    }
}
