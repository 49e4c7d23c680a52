// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use http::Uri;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL: Duration = Duration::from_millis(50);

/// Probe often so state changes show up quickly.
const FAST_FLAGS: &[&str] = &[
    "--listen=127.0.0.1:0",
    "--probe-interval-ms=200",
    "--probe-timeout-ms=500",
    "--initial-probe-delay-ms=100",
    "--start-period-ms=5000",
    "--stop-timeout-ms=3000",
    "--request-timeout-ms=2000",
];

/// Every line the daemon wrote to stdout or stderr, in arrival order.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<String>>>);

impl LogBuffer {
    fn follow(&self, stream: impl Read + Send + 'static, tag: &'static str) {
        let buffer = self.clone();
        thread::spawn(move || {
            for line in BufReader::new(stream).lines().map_while(Result::ok) {
                eprintln!("[{tag}] {line}");
                buffer.0.lock().unwrap().push(line);
            }
        });
    }

    fn find_map<T>(&self, f: impl FnMut(&String) -> Option<T>) -> Vec<T> {
        self.0.lock().unwrap().iter().filter_map(f).collect()
    }
}

/// A running `openrun-supd` child, killed on drop.
pub struct Supd {
    child: Child,
    logs: LogBuffer,
}

impl Supd {
    /// Launch the daemon against `config_dir`.
    pub fn start(config_dir: &Path) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_openrun-supd"))
            .args(FAST_FLAGS)
            .env("OPENRUN_CONFIG_DIR", config_dir)
            .env("OPENRUN_LOG_LEVEL", "info")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn openrun-supd");

        let logs = LogBuffer::default();
        logs.follow(child.stdout.take().unwrap(), "supd");
        logs.follow(child.stderr.take().unwrap(), "supd:err");
        Self { child, logs }
    }

    /// Number of log lines containing `needle` so far.
    pub fn count(&self, needle: &str) -> usize {
        self.logs.find_map(|l| l.contains(needle).then_some(())).len()
    }

    pub fn saw_times(&self, needle: &str, times: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.count(needle) >= times)
    }

    /// Whether a line containing `needle` shows up within [`DEFAULT_TIMEOUT`].
    pub fn saw(&self, needle: &str) -> bool {
        self.saw_times(needle, 1, DEFAULT_TIMEOUT)
    }

    pub fn router_addr(&self) -> SocketAddr {
        const MARKER: &str = "router listening on ";
        assert!(self.saw(MARKER), "router never came up");
        self.logs
            .find_map(|l| l.split_once(MARKER)?.1.trim().parse().ok())
            .into_iter()
            .next()
            .unwrap()
    }

    /// PIDs logged for `workload`, oldest launch first.
    pub fn launched_pids(&self, workload: &str) -> Vec<u32> {
        let marker = format!("[{workload}] launched (pid=");
        self.logs.find_map(|l| {
            let digits: String = l
                .split_once(marker.as_str())?
                .1
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse().ok()
        })
    }

    pub fn signal(&self, sig: Signal) {
        signal::kill(Pid::from_raw(self.child.id() as i32), sig).unwrap();
    }

    /// SIGTERM, then wait for the exit status.
    pub fn stop(&mut self) -> ExitStatus {
        self.signal(Signal::SIGTERM);
        self.wait(Duration::from_secs(20))
    }

    /// Exit status once the daemon is gone; SIGKILLed if `timeout` passes first.
    pub fn wait(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            thread::sleep(POLL);
        }
        let _ = self.child.kill();
        self.child.wait().unwrap()
    }
}

impl Drop for Supd {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !check() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL);
    }
    true
}

/// Drop `<name>.yaml` into `dir`.
pub fn write_config(dir: &Path, name: &str, yaml: &str) {
    std::fs::write(dir.join(format!("{name}.yaml")), yaml).unwrap();
}

/// Descriptor running the `openrun-echo` test backend as `name` on `port`.
pub fn echo_config(name: &str, port: u16, extra: &str) -> String {
    format!(
        "command: {}\nargs: [\"{name}\"]\nport: {port}\n{extra}",
        env!("CARGO_BIN_EXE_openrun-echo")
    )
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub fn pid_gone_within(pid: u32, timeout: Duration) -> bool {
    wait_until(timeout, || !pid_is_alive(pid))
}

/// GET `path` through the router, returning status code and body.
///
/// Runs on its own current-thread runtime so the synchronous tests can call it.
pub fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let client: Client<HttpConnector, Empty<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let uri: Uri = format!("http://{addr}{path}").parse().unwrap();
        let exchange = async {
            let response = client.get(uri).await?;
            let status = response.status().as_u16();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>((status, body))
        };
        let (status, body) = tokio::time::timeout(Duration::from_secs(10), exchange)
            .await
            .unwrap_or_else(|_| panic!("GET {path} timed out"))
            .unwrap_or_else(|e| panic!("GET {path} failed: {e}"));
        (status, String::from_utf8_lossy(&body).into_owned())
    })
}
