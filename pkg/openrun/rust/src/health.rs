// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::HealthCheckError;
use crate::events::{Event, EventSender};
use http::{Request, StatusCode, Uri};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::debug;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The health path answered 2xx.
    Healthy,
    /// The health path answered with a non-2xx status.
    Unhealthy(StatusCode),
    /// No answer: connection refused, reset, or timed out.
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Healthy => write!(f, "healthy"),
            ProbeOutcome::Unhealthy(status) => write!(f, "unhealthy ({status})"),
            ProbeOutcome::Unreachable(reason) => write!(f, "unreachable ({reason})"),
        }
    }
}

/// HTTP prober with a per-probe timeout. Cheap to clone.
#[derive(Clone)]
pub struct Prober {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl Prober {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        // No pooling: every probe opens a fresh connection.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);
        Self { client, timeout }
    }

    pub async fn probe(&self, addr: SocketAddr, path: &str) -> ProbeOutcome {
        match self.check(addr, path).await {
            Ok(status) if status.is_success() => ProbeOutcome::Healthy,
            Ok(status) => ProbeOutcome::Unhealthy(status),
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }

    async fn check(&self, addr: SocketAddr, path: &str) -> Result<StatusCode, HealthCheckError> {
        let uri: Uri = format!("http://{addr}{path}").parse()?;
        let request = Request::get(uri)
            .header(http::header::USER_AGENT, "openrun-health/1")
            .body(Empty::new())?;
        let response = time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| HealthCheckError::Timeout(self.timeout))??;
        Ok(response.status())
    }
}

/// Verdict of the hysteresis tracker on one probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Pass,
    Fail { consecutive: u32 },
    /// The failure that made the consecutive count reach the threshold.
    ThresholdReached { consecutive: u32 },
}

/// Counts consecutive failed probes against a threshold.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    threshold: u32,
    consecutive_failures: u32,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn record(&mut self, outcome: &ProbeOutcome) -> HealthVerdict {
        if outcome.is_healthy() {
            self.consecutive_failures = 0;
            return HealthVerdict::Pass;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures == self.threshold {
            HealthVerdict::ThresholdReached {
                consecutive: self.consecutive_failures,
            }
        } else {
            HealthVerdict::Fail {
                consecutive: self.consecutive_failures,
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Probe schedule of one monitor task.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSchedule {
    pub initial_delay: Duration,
    pub interval: Duration,
}

/// Running health monitor of one launch. Aborted when dropped.
pub struct MonitorHandle {
    task: JoinHandle<()>,
    recheck: Arc<Notify>,
}

impl MonitorHandle {
    /// Wake the monitor for an immediate probe.
    pub fn recheck(&self) {
        self.recheck.notify_one();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Probe `addr`+`path` on a fixed schedule and report every outcome to the supervisor.
pub fn spawn_monitor(
    workload: String,
    generation: u64,
    addr: SocketAddr,
    path: String,
    schedule: ProbeSchedule,
    prober: Prober,
    events: EventSender,
) -> MonitorHandle {
    let recheck = Arc::new(Notify::new());
    let notified = recheck.clone();

    let task = tokio::spawn(async move {
        let mut ticker = time::interval_at(
            Instant::now() + schedule.initial_delay,
            schedule.interval.max(Duration::from_millis(1)),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = notified.notified() => {
                    debug!("[{workload}] out-of-band health re-check");
                    ticker.reset();
                }
            }

            let outcome = prober.probe(addr, &path).await;
            debug!("[{workload}] probe {path}: {outcome}");
            let event = Event::Probe {
                workload: workload.clone(),
                generation,
                outcome,
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    });

    MonitorHandle { task, recheck }
}
