// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::RouteError;
use std::net::SocketAddr;

/// One registered path prefix. `backend` is set only while the workload is UP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub workload: String,
    pub strip_prefix: bool,
    pub backend: Option<SocketAddr>,
}

/// A live route resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub backend: SocketAddr,
    /// Path to send to the backend, without the query string.
    pub forward_path: String,
}

/// Immutable snapshot of prefix → backend mappings. Routes are kept sorted by
/// descending prefix length so the first match is the longest one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<Route>) -> Self {
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        Self { routes }
    }

    /// Longest-prefix match on path segment boundaries.
    pub fn lookup(&self, path: &str) -> Result<RouteMatch<'_>, RouteError> {
        let Some((route, rest)) = self
            .routes
            .iter()
            .find_map(|r| strip_route_prefix(path, &r.prefix).map(|rest| (r, rest)))
        else {
            return Err(RouteError::NoRoute {
                path: path.to_string(),
            });
        };

        let Some(backend) = route.backend else {
            return Err(RouteError::BackendUnavailable {
                workload: route.workload.clone(),
            });
        };

        let forward_path = if route.strip_prefix {
            if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            }
        } else {
            path.to_string()
        };

        Ok(RouteMatch {
            route,
            backend,
            forward_path,
        })
    }

    /// Backend address of a workload, if it is currently routable.
    pub fn backend_for(&self, workload: &str) -> Option<SocketAddr> {
        self.routes
            .iter()
            .find(|r| r.workload == workload)
            .and_then(|r| r.backend)
    }

    /// Routes that currently have a live backend.
    #[cfg(test)]
    pub fn live(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(|r| r.backend.is_some())
    }
}

/// Returns the remainder of `path` after `prefix` when the prefix matches a
/// whole number of path segments.
fn strip_route_prefix<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
