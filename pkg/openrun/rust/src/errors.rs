// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// A workload process could not be started.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("command not found: {command}")]
    CommandNotFound { command: String },
    #[error("permission denied executing {command}")]
    PermissionDenied { command: String },
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },
    #[error("could not check port {port}: {source}")]
    PortCheck {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("reading environment file: {0:#}")]
    Environment(anyhow::Error),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    pub(crate) fn from_spawn(command: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => LaunchError::CommandNotFound {
                command: command.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied {
                command: command.to_string(),
            },
            _ => LaunchError::Spawn {
                command: command.to_string(),
                source,
            },
        }
    }
}

/// A single health probe did not get a usable answer.
#[derive(Error, Debug)]
pub enum HealthCheckError {
    #[error("invalid probe URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("building probe request: {0}")]
    Build(#[from] http::Error),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
}

/// Per-request routing failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route for {path}")]
    NoRoute { path: String },
    #[error("workload {workload} is unavailable")]
    BackendUnavailable { workload: String },
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::NoRoute { .. } => StatusCode::NOT_FOUND,
            RouteError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// One or more workloads had to be force-killed during shutdown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("workloads did not stop within their grace period: {}", .workloads.join(", "))]
pub struct ShutdownTimeoutError {
    pub workloads: Vec<String>,
}
