// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Minimal web workload for end-to-end tests.
//!
//! Listens on `127.0.0.1:$PORT`. `/health` answers 200, or 503 while the file
//! named by `ECHO_UNHEALTHY_FILE` exists. `/crash` exits with code 3. Any
//! other path answers `<name> <method> <path-and-query>`, with the status
//! taken from a `status=<code>` query parameter. With `ECHO_IGNORE_TERM` set,
//! SIGTERM is ignored.

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{info, warn};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};

struct Echo {
    name: String,
    unhealthy_file: Option<PathBuf>,
}

impl Echo {
    fn handle(&self, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/health" => {
                let healthy = self.unhealthy_file.as_ref().is_none_or(|f| !f.exists());
                if healthy {
                    respond(StatusCode::OK, "ok".to_string())
                } else {
                    respond(StatusCode::SERVICE_UNAVAILABLE, "unhealthy".to_string())
                }
            }
            "/crash" => {
                warn!("{} crashing on request", self.name);
                std::process::exit(3);
            }
            _ => {
                let status = req
                    .uri()
                    .query()
                    .into_iter()
                    .flat_map(|q| q.split('&'))
                    .find_map(|pair| pair.strip_prefix("status="))
                    .and_then(|code| code.parse::<u16>().ok())
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::OK);
                let target = req
                    .uri()
                    .path_and_query()
                    .map_or("/", |pq| pq.as_str());
                respond(status, format!("{} {} {}", self.name, req.method(), target))
            }
        }
    }
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let port: u16 = std::env::var("PORT")
        .context("PORT is not set")?
        .parse()
        .context("PORT is not a port number")?;
    let echo = Arc::new(Echo {
        name: std::env::args()
            .nth(1)
            .or_else(|| std::env::var("ECHO_NAME").ok())
            .unwrap_or_else(|| "echo".to_string()),
        unhealthy_file: std::env::var_os("ECHO_UNHEALTHY_FILE").map(PathBuf::from),
    });
    let ignore_term = std::env::var_os("ECHO_IGNORE_TERM").is_some();

    let mut sigterm = signal(SignalKind::terminate())?;
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding 127.0.0.1:{port}"))?;
    info!("{} listening on 127.0.0.1:{port}", echo.name);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let echo = echo.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let response = echo.handle(&req);
                        async move { Ok::<_, Infallible>(response) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
            _ = sigterm.recv() => {
                if ignore_term {
                    info!("{} ignoring SIGTERM", echo.name);
                } else {
                    info!("{} shutting down", echo.name);
                    return Ok(());
                }
            }
        }
    }
}
