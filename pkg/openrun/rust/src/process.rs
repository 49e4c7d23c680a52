// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::OutputMode;
use crate::descriptor::WorkloadDescriptor;
use crate::env::workload_environment;
use crate::errors::LaunchError;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

/// How long to wait for the kernel to reap a process after SIGKILL.
pub const SIGKILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How a workload process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub const UNKNOWN: ExitInfo = ExitInfo {
        code: None,
        signal: None,
    };

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(sig) => write!(f, "signal {sig}"),
                Err(_) => write!(f, "signal {sig}"),
            },
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Handle on a launched workload process. The child itself is owned by a
/// reaper task; clones of the handle observe the same exit.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    workload: String,
    pid: u32,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl InstanceHandle {
    pub fn workload(&self) -> &str {
        &self.workload
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> ExitInfo {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ExitInfo::UNKNOWN),
            Err(_) => ExitInfo::UNKNOWN,
        }
    }

    /// Signal the workload's process group while the leader is alive.
    pub fn send_signal(&self, sig: Signal) {
        if self.has_exited() {
            return;
        }
        if let Err(e) = signal_group(self.pid, sig) {
            warn!("[{}] failed to send {sig}: {e}", self.workload);
        }
    }

    /// SIGKILL whatever is left of the process group once the leader is gone.
    pub fn sweep_group(&self) {
        match signal_group(self.pid, Signal::SIGKILL) {
            Ok(()) => debug!("[{}] killed leftover processes in group", self.workload),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("[{}] failed to sweep process group: {e}", self.workload),
        }
    }
}

// Workloads are spawned as process group leaders, so the pid is the pgid.
// A pgid of 0 would address the supervisor's own group.
fn signal_group(pid: u32, sig: Signal) -> nix::Result<()> {
    if pid == 0 {
        return Err(Errno::ESRCH);
    }
    signal::killpg(Pid::from_raw(pid as i32), sig)
}

fn leader_pid(command: &str, id: Option<u32>) -> Result<u32, LaunchError> {
    match id {
        Some(pid) if pid > 0 => Ok(pid),
        _ => Err(LaunchError::Spawn {
            command: command.to_string(),
            source: std::io::Error::other("spawned process has no pid"),
        }),
    }
}

/// Start the workload's process with its port injected, in its own process group.
pub fn launch(descriptor: &WorkloadDescriptor) -> Result<InstanceHandle, LaunchError> {
    check_port_free(descriptor.port)?;
    let env = workload_environment(descriptor).map_err(LaunchError::Environment)?;

    let mut cmd = Command::new(&descriptor.command);
    cmd.args(descriptor.resolved_args());
    cmd.env_clear();
    cmd.envs(&env);

    if let Some(ref dir) = descriptor.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(stdio_for(descriptor.stdout));
    cmd.stderr(stdio_for(descriptor.stderr));
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| LaunchError::from_spawn(&descriptor.command, e))?;

    let pid = leader_pid(&descriptor.command, child.id())?;
    info!(
        "[{}] launched (pid={}, port={}, cmd={})",
        descriptor.name, pid, descriptor.port, descriptor.command
    );

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(descriptor.name.clone(), false, stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(descriptor.name.clone(), true, stderr));
    }

    let (tx, rx) = watch::channel(None);
    let name = descriptor.name.clone();
    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => ExitInfo::from(status),
            Err(e) => {
                warn!("[{name}] failed to wait on process: {e}");
                ExitInfo::UNKNOWN
            }
        };
        info!("[{name}] exited with {exit}");
        let _ = tx.send(Some(exit));
    });

    Ok(InstanceHandle {
        workload: descriptor.name.clone(),
        pid,
        exit: rx,
    })
}

fn check_port_free(port: u16) -> Result<(), LaunchError> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(LaunchError::PortInUse { port }),
        Err(source) => Err(LaunchError::PortCheck { port, source }),
    }
}

fn stdio_for(mode: OutputMode) -> Stdio {
    match mode {
        OutputMode::Log => Stdio::piped(),
        OutputMode::Inherit => Stdio::inherit(),
        OutputMode::Null => Stdio::null(),
    }
}

async fn forward_output<R: AsyncRead + Unpin>(workload: String, is_stderr: bool, reader: R) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if is_stderr {
                    warn!("[{workload}] {line}");
                } else {
                    info!("[{workload}] {line}");
                }
            }
            Err(e) => {
                debug!("[{workload}] output stream closed: {e}");
                break;
            }
        }
    }
}

/// Result of stopping a workload process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited(ExitInfo),
    Graceful(ExitInfo),
    /// SIGKILL was needed; `None` if the process could not be reaped even then.
    Killed(Option<ExitInfo>),
}

impl StopOutcome {
    pub fn is_clean(&self) -> bool {
        !matches!(self, StopOutcome::Killed(_))
    }
}

/// SIGTERM the process group, wait up to `stop_timeout`, then SIGKILL.
pub async fn stop(handle: &mut InstanceHandle, stop_timeout: Duration) -> StopOutcome {
    if let Some(exit) = handle.exit_info() {
        handle.sweep_group();
        return StopOutcome::AlreadyExited(exit);
    }

    info!("[{}] sending SIGTERM", handle.workload);
    handle.send_signal(Signal::SIGTERM);
    if let Ok(exit) = timeout(stop_timeout, handle.wait()).await {
        handle.sweep_group();
        return StopOutcome::Graceful(exit);
    }

    warn!(
        "[{}] stop timeout ({}ms) reached, sending SIGKILL",
        handle.workload,
        stop_timeout.as_millis()
    );
    handle.send_signal(Signal::SIGKILL);
    match timeout(SIGKILL_TIMEOUT, handle.wait()).await {
        Ok(exit) => {
            handle.sweep_group();
            StopOutcome::Killed(Some(exit))
        }
        Err(_) => {
            warn!("[{}] still running after SIGKILL, giving up", handle.workload);
            StopOutcome::Killed(None)
        }
    }
}
