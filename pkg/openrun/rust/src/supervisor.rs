// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Single control loop owning every workload instance.
//!
//! Monitors, exit watchers and restart timers only send [`Event`]s; all state
//! changes happen here, and every change republishes the route table and the
//! status snapshot on `watch` channels.

use crate::config::SupervisorSettings;
use crate::descriptor::DescriptorStore;
use crate::errors::ShutdownTimeoutError;
use crate::events::{self, Event, EventReceiver, EventSender};
use crate::health::{HealthVerdict, ProbeOutcome, ProbeSchedule, Prober, spawn_monitor};
use crate::process::{self, ExitInfo, InstanceHandle};
use crate::routes::{Route, RouteTable};
use crate::shutdown;
use crate::state::{StatusSnapshot, WorkloadInstance, WorkloadState};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

/// Handles shared by every per-instance operation.
struct Context {
    settings: SupervisorSettings,
    prober: Prober,
    events: EventSender,
}

pub struct Supervisor {
    ctx: Context,
    instances: BTreeMap<String, WorkloadInstance>,
    events_rx: EventReceiver,
    routes: watch::Sender<Arc<RouteTable>>,
    status: watch::Sender<Arc<StatusSnapshot>>,
}

impl Supervisor {
    pub fn new(store: &DescriptorStore, settings: SupervisorSettings) -> Self {
        let (events, events_rx) = events::channel();
        let instances = store
            .iter()
            .map(|d| {
                (
                    d.name.clone(),
                    WorkloadInstance::new(d.clone(), settings.failure_threshold),
                )
            })
            .collect();
        let (routes, _) = watch::channel(Arc::new(RouteTable::default()));
        let (status, _) = watch::channel(Arc::new(StatusSnapshot::default()));

        let supervisor = Self {
            ctx: Context {
                prober: Prober::new(settings.probe_timeout),
                settings,
                events,
            },
            instances,
            events_rx,
            routes,
            status,
        };
        supervisor.publish();
        supervisor
    }

    /// Route table snapshots, replaced on every routable-state change.
    pub fn routes(&self) -> watch::Receiver<Arc<RouteTable>> {
        self.routes.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.status.subscribe()
    }

    /// Sender for out-of-band events such as router-triggered re-checks.
    pub fn events(&self) -> EventSender {
        self.ctx.events.clone()
    }

    /// Launch every workload, then process events until `shutdown` resolves.
    /// Running instances are then stopped concurrently.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), ShutdownTimeoutError>
    where
        F: Future<Output = ()>,
    {
        self.start_all();
        self.publish();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);
                    self.publish();
                }
            }
        }

        self.shutdown().await
    }

    fn start_all(&mut self) {
        for instance in self.instances.values_mut() {
            if instance.descriptor.should_start() {
                self.ctx.launch(instance);
            } else {
                transition(instance, WorkloadState::Stopped);
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Probe {
                workload,
                generation,
                outcome,
            } => self.on_probe(&workload, generation, outcome),
            Event::Exited {
                workload,
                generation,
                exit,
            } => self.on_exited(&workload, generation, exit),
            Event::RestartDue { workload, ticket } => self.on_restart_due(&workload, ticket),
            Event::Recheck { workload } => {
                if let Some(monitor) = self
                    .instances
                    .get(&workload)
                    .and_then(|i| i.monitor.as_ref())
                {
                    monitor.recheck();
                }
            }
        }
    }

    fn on_probe(&mut self, workload: &str, generation: u64, outcome: ProbeOutcome) {
        let Some(instance) = self.instances.get_mut(workload) else {
            return;
        };
        // A dropped monitor may still have a result in flight.
        if generation != instance.generation || instance.monitor.is_none() {
            debug!("[{workload}] ignoring stale probe (generation {generation})");
            return;
        }
        instance.last_probe = Some(SystemTime::now());

        if !outcome.is_healthy()
            && instance.state == WorkloadState::Starting
            && instance
                .launched_at
                .is_some_and(|t| t.elapsed() < self.ctx.settings.start_period)
        {
            debug!("[{workload}] probe {outcome} during start period, ignored");
            return;
        }

        match instance.health.record(&outcome) {
            HealthVerdict::Pass => match instance.state {
                WorkloadState::Starting => {
                    transition(instance, WorkloadState::Up);
                    instance.backoff.reset();
                }
                WorkloadState::Down => {
                    if instance.restart_pending {
                        info!("[{workload}] recovered, pending restart cancelled");
                        cancel_restart(instance);
                    }
                    transition(instance, WorkloadState::Up);
                    instance.backoff.reset();
                }
                _ => {}
            },
            HealthVerdict::Fail { consecutive } => {
                debug!(
                    "[{workload}] probe failed ({consecutive}/{}): {outcome}",
                    self.ctx.settings.failure_threshold
                );
            }
            HealthVerdict::ThresholdReached { consecutive } => {
                if !matches!(instance.state, WorkloadState::Up | WorkloadState::Starting) {
                    return;
                }
                warn!("[{workload}] {consecutive} consecutive failed probes, last: {outcome}");
                transition(instance, WorkloadState::Down);
                if instance.descriptor.restart.restarts_after_failure() {
                    self.ctx.schedule_restart(instance);
                }
            }
        }
    }

    fn on_exited(&mut self, workload: &str, generation: u64, exit: ExitInfo) {
        let Some(instance) = self.instances.get_mut(workload) else {
            return;
        };
        if generation != instance.generation {
            debug!("[{workload}] ignoring exit of previous process (generation {generation})");
            return;
        }
        instance.monitor = None;
        if let Some(handle) = instance.handle.take() {
            handle.sweep_group();
        }

        if instance.relaunch_on_exit {
            self.ctx.launch(instance);
            return;
        }
        if matches!(
            instance.state,
            WorkloadState::Stopped | WorkloadState::PermanentlyFailed
        ) {
            return;
        }

        warn!("[{workload}] exited unexpectedly ({exit})");
        instance.health.reset();
        transition(instance, WorkloadState::Down);
        if instance.restart_pending {
            // The scheduled restart launches once it is due.
            return;
        }
        if instance.descriptor.restart.restarts_after_exit(&exit) {
            self.ctx.schedule_restart(instance);
        } else {
            info!(
                "[{workload}] not restarting after {exit} (restart={})",
                instance.descriptor.restart.mode
            );
            self.ctx.give_up(instance);
        }
    }

    fn on_restart_due(&mut self, workload: &str, ticket: u64) {
        let Some(instance) = self.instances.get_mut(workload) else {
            return;
        };
        if ticket != instance.restart_ticket || !instance.restart_pending {
            debug!("[{workload}] restart ticket {ticket} no longer valid");
            return;
        }
        instance.restart_pending = false;
        if instance.state != WorkloadState::Down {
            return;
        }

        instance.monitor = None;
        if instance.handle.as_ref().is_some_and(|h| !h.has_exited()) {
            // Relaunch only after the exit of the old process is confirmed.
            info!("[{workload}] stopping unhealthy process before restart");
            instance.relaunch_on_exit = true;
            self.ctx.stop_in_background(instance);
        } else {
            if let Some(handle) = instance.handle.take() {
                handle.sweep_group();
            }
            self.ctx.launch(instance);
        }
    }

    /// Rebuild the route table from instance states and refresh status.
    fn publish(&self) {
        let table = RouteTable::new(
            self.instances
                .values()
                .map(|instance| Route {
                    prefix: instance.descriptor.route.clone(),
                    workload: instance.descriptor.name.clone(),
                    strip_prefix: instance.descriptor.strip_prefix,
                    backend: instance
                        .state
                        .is_routable()
                        .then(|| instance.descriptor.local_addr()),
                })
                .collect(),
        );
        self.routes.send_if_modified(move |current| {
            if **current == table {
                false
            } else {
                *current = Arc::new(table);
                true
            }
        });

        let snapshot = StatusSnapshot {
            workloads: self
                .instances
                .values()
                .map(WorkloadInstance::status)
                .collect(),
        };
        self.status.send_replace(Arc::new(snapshot));
    }

    async fn shutdown(&mut self) -> Result<(), ShutdownTimeoutError> {
        let mut handles: Vec<(InstanceHandle, Duration)> = Vec::new();
        for instance in self.instances.values_mut() {
            instance.monitor = None;
            instance.relaunch_on_exit = false;
            cancel_restart(instance);
            if let Some(handle) = instance.handle.take() {
                handles.push((handle, self.ctx.grace_period(instance)));
            }
            transition(instance, WorkloadState::Stopped);
        }
        // Routes are withdrawn before any process is signalled.
        self.publish();

        info!("stopping {} workload process(es)", handles.len());
        let outcomes = shutdown::shutdown_all(handles).await;
        self.publish();
        shutdown::check_outcomes(&outcomes)
    }
}

impl Context {
    fn launch(&self, instance: &mut WorkloadInstance) {
        let name = instance.descriptor.name.clone();
        instance.generation += 1;
        if instance.generation > 1 {
            instance.restarts += 1;
        }
        instance.relaunch_on_exit = false;
        instance.health.reset();
        instance.monitor = None;

        let handle = match process::launch(&instance.descriptor) {
            Ok(handle) => handle,
            Err(e) => {
                error!("[{name}] failed to launch: {e}");
                instance.launched_at = None;
                transition(instance, WorkloadState::Down);
                if instance.descriptor.restart.restarts_after_failure() {
                    self.schedule_restart(instance);
                } else {
                    self.give_up(instance);
                }
                return;
            }
        };

        let generation = instance.generation;
        let mut watched = handle.clone();
        let events = self.events.clone();
        let workload = name.clone();
        tokio::spawn(async move {
            let exit = watched.wait().await;
            let _ = events
                .send(Event::Exited {
                    workload,
                    generation,
                    exit,
                })
                .await;
        });

        instance.monitor = Some(spawn_monitor(
            name,
            generation,
            instance.descriptor.local_addr(),
            instance.descriptor.health_path.clone(),
            ProbeSchedule {
                initial_delay: self.settings.initial_probe_delay,
                interval: self.settings.probe_interval,
            },
            self.prober.clone(),
            self.events.clone(),
        ));
        instance.handle = Some(handle);
        instance.launched_at = Some(Instant::now());
        transition(instance, WorkloadState::Starting);
    }

    fn schedule_restart(&self, instance: &mut WorkloadInstance) {
        let Some(delay) = instance.backoff.next_delay() else {
            self.give_up(instance);
            return;
        };
        instance.restart_ticket += 1;
        instance.restart_pending = true;
        info!(
            "[{}] restarting in {}ms (attempt {}/{})",
            instance.descriptor.name,
            delay.as_millis(),
            instance.backoff.attempts(),
            instance.backoff.max_attempts()
        );

        let events = self.events.clone();
        let workload = instance.descriptor.name.clone();
        let ticket = instance.restart_ticket;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RestartDue { workload, ticket }).await;
        });
    }

    /// Mark the instance permanently failed and stop whatever is left of it.
    fn give_up(&self, instance: &mut WorkloadInstance) {
        cancel_restart(instance);
        instance.monitor = None;
        transition(instance, WorkloadState::PermanentlyFailed);
        error!(
            "[{}] permanently failed after {} restart(s)",
            instance.descriptor.name, instance.restarts
        );
        if instance.handle.as_ref().is_some_and(|h| !h.has_exited()) {
            self.stop_in_background(instance);
        }
    }

    fn stop_in_background(&self, instance: &WorkloadInstance) {
        let Some(ref handle) = instance.handle else {
            return;
        };
        let mut handle = handle.clone();
        let grace = self.grace_period(instance);
        tokio::spawn(async move {
            process::stop(&mut handle, grace).await;
        });
    }

    fn grace_period(&self, instance: &WorkloadInstance) -> Duration {
        instance
            .descriptor
            .stop_timeout
            .unwrap_or(self.settings.stop_timeout)
    }
}

fn cancel_restart(instance: &mut WorkloadInstance) {
    if instance.restart_pending {
        instance.restart_pending = false;
        instance.restart_ticket += 1;
    }
}

/// Apply a lifecycle transition if the state machine allows it.
fn transition(instance: &mut WorkloadInstance, next: WorkloadState) -> bool {
    let current = instance.state;
    if current == next {
        return false;
    }
    if !current.can_transition_to(next) {
        debug!(
            "[{}] ignoring transition {current} -> {next}",
            instance.descriptor.name
        );
        return false;
    }
    info!("[{}] {current} -> {next}", instance.descriptor.name);
    instance.state = next;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartMode;
    use crate::descriptor::WorkloadDescriptor;
    use crate::descriptor::tests::make_config;
    use crate::process::tests::free_port;
    use http::StatusCode;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    use std::net::SocketAddr;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Monitors never fire on their own; tests inject probe results.
    fn quiet_settings() -> SupervisorSettings {
        SupervisorSettings {
            probe_interval: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(1),
            initial_probe_delay: Duration::from_secs(3600),
            failure_threshold: 3,
            start_period: Duration::ZERO,
            stop_timeout: Duration::from_secs(2),
        }
    }

    struct Running {
        routes: watch::Receiver<Arc<RouteTable>>,
        status: watch::Receiver<Arc<StatusSnapshot>>,
        events: EventSender,
        stop: oneshot::Sender<()>,
        task: JoinHandle<Result<(), ShutdownTimeoutError>>,
    }

    impl Running {
        async fn wait_state(&mut self, name: &str, state: WorkloadState) {
            let reached = matches!(
                timeout(
                    WAIT,
                    self.status
                        .wait_for(|s| s.get(name).is_some_and(|w| w.state == state)),
                )
                .await,
                Ok(Ok(_))
            );
            assert!(
                reached,
                "[{name}] never reached {state}: {:?}",
                self.status.borrow().get(name)
            );
        }

        async fn wait_backend(&mut self, name: &str, expected: Option<SocketAddr>) {
            let reached = matches!(
                timeout(
                    WAIT,
                    self.routes.wait_for(|t| t.backend_for(name) == expected),
                )
                .await,
                Ok(Ok(_))
            );
            assert!(reached, "[{name}] backend never became {expected:?}");
        }

        fn generation(&self, name: &str) -> u64 {
            self.status.borrow().get(name).map_or(0, |w| w.generation)
        }

        async fn probe(&self, name: &str, outcome: ProbeOutcome) {
            self.probe_generation(name, self.generation(name), outcome)
                .await;
        }

        async fn probe_generation(&self, name: &str, generation: u64, outcome: ProbeOutcome) {
            self.events
                .send(Event::Probe {
                    workload: name.to_string(),
                    generation,
                    outcome,
                })
                .await
                .unwrap();
        }

        async fn shutdown(self) -> Result<(), ShutdownTimeoutError> {
            let _ = self.stop.send(());
            timeout(Duration::from_secs(15), self.task)
                .await
                .unwrap()
                .unwrap()
        }
    }

    fn start(descriptors: Vec<WorkloadDescriptor>, settings: SupervisorSettings) -> Running {
        let mut store = DescriptorStore::default();
        for d in descriptors {
            store.register(d).unwrap();
        }
        let supervisor = Supervisor::new(&store, settings);
        let routes = supervisor.routes();
        let status = supervisor.status();
        let events = supervisor.events();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(supervisor.run(async move {
            let _ = stopped.await;
        }));
        Running {
            routes,
            status,
            events,
            stop,
            task,
        }
    }

    fn descriptor(
        name: &str,
        command: &str,
        args: Vec<&str>,
        tweak: impl FnOnce(&mut crate::config::WorkloadConfig),
    ) -> WorkloadDescriptor {
        let mut cfg = make_config(command, args, free_port());
        tweak(&mut cfg);
        WorkloadDescriptor::from_config(name, cfg).unwrap()
    }

    fn unhealthy() -> ProbeOutcome {
        ProbeOutcome::Unhealthy(StatusCode::SERVICE_UNAVAILABLE)
    }

    // ===== Group 1: health-driven routing =====

    #[tokio::test]
    async fn test_healthy_probe_publishes_route() {
        let api = descriptor("api", "/bin/sleep", vec!["60"], |_| {});
        let addr = api.local_addr();
        let mut sv = start(vec![api], quiet_settings());

        sv.wait_state("api", WorkloadState::Starting).await;
        assert_eq!(sv.routes.borrow().backend_for("api"), None);

        sv.probe("api", ProbeOutcome::Healthy).await;
        sv.wait_state("api", WorkloadState::Up).await;
        sv.wait_backend("api", Some(addr)).await;

        let status = sv.status.borrow().get("api").cloned().unwrap();
        assert!(status.pid.is_some());
        assert!(status.last_probe_unix_ms.is_some());

        assert!(sv.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_threshold_failures_withdraw_route_and_recovery_cancels_restart() {
        let api = descriptor("api", "/bin/sleep", vec!["60"], |cfg| {
            cfg.restart_sec = Some(1.0);
        });
        let addr = api.local_addr();
        let mut sv = start(vec![api], quiet_settings());
        sv.wait_state("api", WorkloadState::Starting).await;
        sv.probe("api", ProbeOutcome::Healthy).await;
        sv.wait_backend("api", Some(addr)).await;

        sv.probe("api", unhealthy()).await;
        sv.probe("api", ProbeOutcome::Unreachable("refused".into()))
            .await;
        // Two failures are below the threshold.
        sv.probe("api", ProbeOutcome::Healthy).await;
        sv.probe("api", unhealthy()).await;
        sv.probe("api", unhealthy()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sv.routes.borrow().backend_for("api"), Some(addr));

        sv.probe("api", unhealthy()).await;
        sv.wait_state("api", WorkloadState::Down).await;
        sv.wait_backend("api", None).await;

        sv.probe("api", ProbeOutcome::Healthy).await;
        sv.wait_state("api", WorkloadState::Up).await;
        sv.wait_backend("api", Some(addr)).await;

        // The restart that was due after 1s never happens.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sv.generation("api"), 1);
        assert_eq!(sv.status.borrow().get("api").unwrap().restarts, 0);

        assert!(sv.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_down_restart_replaces_process() {
        let api = descriptor("api", "/bin/sleep", vec!["60"], |cfg| {
            cfg.restart_sec = Some(0.1);
        });
        let mut sv = start(vec![api], quiet_settings());
        sv.wait_state("api", WorkloadState::Starting).await;
        sv.probe("api", ProbeOutcome::Healthy).await;
        sv.wait_state("api", WorkloadState::Up).await;
        let first_pid = sv.status.borrow().get("api").unwrap().pid.unwrap();

        for _ in 0..3 {
            sv.probe("api", unhealthy()).await;
        }
        sv.wait_state("api", WorkloadState::Down).await;

        let relaunched = matches!(
            timeout(
                WAIT,
                sv.status.wait_for(|s| {
                    s.get("api")
                        .is_some_and(|w| w.generation == 2 && w.state == WorkloadState::Starting)
                }),
            )
            .await,
            Ok(Ok(_))
        );
        assert!(relaunched);

        let status = sv.status.borrow().get("api").cloned().unwrap();
        assert_eq!(status.restarts, 1);
        assert_ne!(status.pid, Some(first_pid));

        assert!(sv.shutdown().await.is_ok());
    }

    /// True once `pid` has exited, whether or not it was reaped yet.
    fn exited(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn test_restart_waits_for_slow_stopper_to_exit() {
        let api = descriptor(
            "api",
            "/bin/sh",
            vec!["-c", "trap '' TERM; sleep 60"],
            |cfg| {
                cfg.restart_sec = Some(0.1);
                cfg.stop_timeout = Some(1);
            },
        );
        let mut sv = start(vec![api], quiet_settings());
        sv.wait_state("api", WorkloadState::Starting).await;
        sv.probe("api", ProbeOutcome::Healthy).await;
        sv.wait_state("api", WorkloadState::Up).await;
        let first_pid = sv.status.borrow().get("api").unwrap().pid.unwrap();

        for _ in 0..3 {
            sv.probe("api", unhealthy()).await;
        }
        sv.wait_state("api", WorkloadState::Down).await;

        // The restart is due after 100ms, but SIGTERM is ignored for the
        // whole stop timeout and the old process keeps its slot meanwhile.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!exited(first_pid), "old process should still be stopping");
        assert_eq!(sv.generation("api"), 1);

        let mut old_gone_at_relaunch = None;
        let relaunched = matches!(
            timeout(
                WAIT,
                sv.status.wait_for(|s| {
                    let relaunched = s.get("api").is_some_and(|w| w.generation == 2);
                    if relaunched && old_gone_at_relaunch.is_none() {
                        old_gone_at_relaunch = Some(exited(first_pid));
                    }
                    relaunched
                }),
            )
            .await,
            Ok(Ok(_))
        );
        assert!(relaunched, "no relaunch after the old process was killed");
        assert_eq!(
            old_gone_at_relaunch,
            Some(true),
            "generation 2 launched while pid {first_pid} was still running"
        );
        assert_ne!(
            sv.status.borrow().get("api").unwrap().pid,
            Some(first_pid)
        );

        // The new process ignores SIGTERM too.
        assert!(sv.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_start_period_ignores_failures() {
        let api = descriptor("api", "/bin/sleep", vec!["60"], |_| {});
        let settings = SupervisorSettings {
            start_period: Duration::from_secs(3600),
            ..quiet_settings()
        };
        let mut sv = start(vec![api], settings);
        sv.wait_state("api", WorkloadState::Starting).await;

        for _ in 0..5 {
            sv.probe("api", unhealthy()).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = sv.status.borrow().get("api").cloned().unwrap();
        assert_eq!(status.state, WorkloadState::Starting);
        assert_eq!(status.consecutive_failures, 0);

        assert!(sv.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_generation_probe_is_ignored() {
        let api = descriptor("api", "/bin/sleep", vec!["60"], |_| {});
        let mut sv = start(vec![api], quiet_settings());
        sv.wait_state("api", WorkloadState::Starting).await;

        sv.probe_generation("api", 0, ProbeOutcome::Healthy).await;
        sv.probe_generation("api", 9, ProbeOutcome::Healthy).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            sv.status.borrow().get("api").unwrap().state,
            WorkloadState::Starting
        );

        assert!(sv.shutdown().await.is_ok());
    }

    // ===== Group 2: process exits and restart policy =====

    #[tokio::test]
    async fn test_killed_externally_goes_down_immediately() {
        let api = descriptor("api", "/bin/sleep", vec!["60"], |cfg| {
            cfg.restart_sec = Some(30.0);
        });
        let addr = api.local_addr();
        let mut sv = start(vec![api], quiet_settings());
        sv.wait_state("api", WorkloadState::Starting).await;
        sv.probe("api", ProbeOutcome::Healthy).await;
        sv.wait_backend("api", Some(addr)).await;

        let pid = sv.status.borrow().get("api").unwrap().pid.unwrap();
        killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

        sv.wait_state("api", WorkloadState::Down).await;
        sv.wait_backend("api", None).await;
        assert_eq!(sv.status.borrow().get("api").unwrap().pid, None);

        assert!(sv.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_crash_loop_becomes_permanently_failed() {
        let api = descriptor("api", "/bin/sh", vec!["-c", "exit 1"], |cfg| {
            cfg.restart_sec = Some(0.05);
            cfg.restart_max_attempts = Some(2);
        });
        let mut sv = start(vec![api], quiet_settings());
        sv.wait_state("api", WorkloadState::PermanentlyFailed).await;

        let status = sv.status.borrow().get("api").cloned().unwrap();
        assert_eq!(status.generation, 3);
        assert_eq!(status.restarts, 2);
        assert_eq!(status.pid, None);
        assert_eq!(sv.routes.borrow().backend_for("api"), None);

        assert!(sv.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_exit_under_never_is_final() {
        let api = descriptor("api", "/bin/sh", vec!["-c", "exit 0"], |cfg| {
            cfg.restart = RestartMode::Never;
        });
        let mut sv = start(vec![api], quiet_settings());
        sv.wait_state("api", WorkloadState::PermanentlyFailed).await;
        assert_eq!(sv.generation("api"), 1);
        assert!(sv.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_on_failure_restarts_only_failed_exits() {
        let clean = descriptor("clean", "/bin/sh", vec!["-c", "exit 0"], |cfg| {
            cfg.restart = RestartMode::OnFailure;
            cfg.restart_sec = Some(0.05);
        });
        let failing = descriptor("failing", "/bin/sh", vec!["-c", "exit 3"], |cfg| {
            cfg.restart = RestartMode::OnFailure;
            cfg.restart_sec = Some(0.05);
            cfg.restart_max_attempts = Some(1);
        });
        let mut sv = start(vec![clean, failing], quiet_settings());
        sv.wait_state("clean", WorkloadState::PermanentlyFailed).await;
        sv.wait_state("failing", WorkloadState::PermanentlyFailed).await;

        assert_eq!(sv.generation("clean"), 1);
        assert_eq!(sv.generation("failing"), 2);
        assert!(sv.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_launch_failure_is_isolated() {
        let broken = descriptor("broken", "/nonexistent/openrun-test-binary", vec![], |cfg| {
            cfg.restart = RestartMode::Never;
        });
        let api = descriptor("api", "/bin/sleep", vec!["60"], |_| {});
        let mut sv = start(vec![broken, api], quiet_settings());

        sv.wait_state("broken", WorkloadState::PermanentlyFailed).await;
        sv.wait_state("api", WorkloadState::Starting).await;
        sv.probe("api", ProbeOutcome::Healthy).await;
        sv.wait_state("api", WorkloadState::Up).await;

        assert!(sv.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_auto_start_false_is_stopped() {
        let idle = descriptor("idle", "/bin/sleep", vec!["60"], |cfg| {
            cfg.auto_start = false;
        });
        let mut sv = start(vec![idle], quiet_settings());
        sv.wait_state("idle", WorkloadState::Stopped).await;
        let status = sv.status.borrow().get("idle").cloned().unwrap();
        assert_eq!(status.pid, None);
        assert_eq!(status.generation, 0);
        assert!(sv.shutdown().await.is_ok());
    }

    // ===== Group 3: shutdown =====

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let a = descriptor("a", "/bin/sleep", vec!["60"], |_| {});
        let b = descriptor("b", "/bin/sleep", vec!["60"], |_| {});
        let mut sv = start(vec![a, b], quiet_settings());
        sv.wait_state("a", WorkloadState::Starting).await;
        sv.wait_state("b", WorkloadState::Starting).await;
        sv.probe("a", ProbeOutcome::Healthy).await;
        sv.wait_state("a", WorkloadState::Up).await;

        let status = sv.status.clone();
        let routes = sv.routes.clone();
        assert!(sv.shutdown().await.is_ok());

        let snapshot = status.borrow().clone();
        for w in &snapshot.workloads {
            assert_eq!(w.state, WorkloadState::Stopped, "{}", w.name);
            assert_eq!(w.pid, None);
        }
        assert_eq!(routes.borrow().live().count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_reports_force_killed() {
        let stubborn = descriptor(
            "stubborn",
            "/bin/sh",
            vec!["-c", "trap '' TERM; sleep 60"],
            |cfg| cfg.stop_timeout = Some(1),
        );
        let polite = descriptor("polite", "/bin/sleep", vec!["60"], |_| {});
        let mut sv = start(vec![stubborn, polite], quiet_settings());
        sv.wait_state("stubborn", WorkloadState::Starting).await;
        sv.wait_state("polite", WorkloadState::Starting).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = sv.shutdown().await.unwrap_err();
        assert_eq!(err.workloads, vec!["stubborn".to_string()]);
    }
}
