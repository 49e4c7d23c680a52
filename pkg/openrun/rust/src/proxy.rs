// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! HTTP/1.1 reverse proxy in front of the workloads.
//!
//! Reads the supervisor's route table snapshot per request and never mutates
//! workload state; a failed upstream connection only asks the supervisor for
//! an early health re-check.

use crate::errors::RouteError;
use crate::events::{Event, EventSender};
use crate::routes::{Route, RouteTable};
use crate::state::StatusSnapshot;
use http::header::{CONNECTION, CONTENT_TYPE, HOST, HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Reserved path serving the JSON status of every workload.
pub const STATUS_PATH: &str = "/_openrun/status";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// How long open connections may finish in-flight requests after shutdown.
pub const DRAIN_PERIOD: Duration = Duration::from_secs(5);

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");

static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
pub struct Router {
    routes: watch::Receiver<Arc<RouteTable>>,
    status: watch::Receiver<Arc<StatusSnapshot>>,
    events: EventSender,
    client: Client<HttpConnector, ProxyBody>,
    request_timeout: Duration,
}

impl Router {
    pub fn new(
        routes: watch::Receiver<Arc<RouteTable>>,
        status: watch::Receiver<Arc<StatusSnapshot>>,
        events: EventSender,
        request_timeout: Duration,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            routes,
            status,
            events,
            client,
            request_timeout,
        }
    }

    /// Dispatch one request: status endpoint, proxied workload, 404 or 503.
    pub async fn route<B>(&self, req: Request<B>, peer: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.uri().path() == STATUS_PATH {
            return self.status_response();
        }

        // Clone the snapshot so no watch guard is held across an await.
        let table = self.routes.borrow().clone();
        let matched = match table.lookup(req.uri().path()) {
            Ok(matched) => matched,
            Err(e) => {
                debug!("{} {}: {e}", req.method(), req.uri().path());
                return error_response(&e);
            }
        };

        let workload = matched.route.workload.clone();
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{}?{query}", matched.forward_path),
            None => matched.forward_path.clone(),
        };
        let uri: Uri = match format!("http://{}{path_and_query}", matched.backend).parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!("[{workload}] cannot build upstream URI for {path_and_query}: {e}");
                return text_response(StatusCode::BAD_GATEWAY, "bad gateway\n");
            }
        };

        let method = req.method().clone();
        let original_path = req.uri().path().to_string();
        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        add_forwarded_headers(&mut parts.headers, peer, matched.route);
        let upstream = Request::from_parts(
            parts,
            body.map_err(|e| -> BoxError { e.into() }).boxed_unsync(),
        );

        match time::timeout(self.request_timeout, self.client.request(upstream)).await {
            Ok(Ok(response)) => {
                debug!(
                    "{method} {original_path} -> [{workload}] {}",
                    response.status()
                );
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(
                    parts,
                    body.map_err(|e| -> BoxError { e.into() }).boxed_unsync(),
                )
            }
            Ok(Err(e)) => {
                warn!("[{workload}] upstream request failed: {e}");
                self.request_recheck(workload)
            }
            Err(_) => {
                warn!(
                    "[{workload}] upstream did not answer within {}ms",
                    self.request_timeout.as_millis()
                );
                self.request_recheck(workload)
            }
        }
    }

    fn request_recheck(&self, workload: String) -> Response<ProxyBody> {
        let error = RouteError::BackendUnavailable {
            workload: workload.clone(),
        };
        if self.events.try_send(Event::Recheck { workload }).is_err() {
            debug!("event queue full, re-check dropped");
        }
        error_response(&error)
    }

    fn status_response(&self) -> Response<ProxyBody> {
        let snapshot = self.status.borrow().clone();
        match serde_json::to_vec(&*snapshot) {
            Ok(json) => {
                let mut response = Response::new(full(json));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                response
            }
            Err(e) => {
                error!("Failed to serialize status: {e}");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error\n")
            }
        }
    }
}

fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn error_response(error: &RouteError) -> Response<ProxyBody> {
    text_response(error.status(), format!("{error}\n"))
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, peer: SocketAddr, route: &Route) {
    let peer_ip = peer.ip().to_string();
    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {peer_ip}"),
        None => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if route.strip_prefix
        && route.prefix != "/"
        && let Ok(value) = HeaderValue::from_str(&route.prefix)
    {
        headers.insert(X_FORWARDED_PREFIX, value);
    }
}

/// Accept connections until `shutdown` resolves, then let open connections
/// drain for [`DRAIN_PERIOD`] before aborting them.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F)
where
    F: Future<Output = ()>,
{
    let (draining_tx, draining_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        router.clone(),
                        draining_rx.clone(),
                    ));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    let _ = draining_tx.send(true);
    if !connections.is_empty() {
        info!("draining {} open connection(s)", connections.len());
    }
    let drained = time::timeout(DRAIN_PERIOD, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "aborting {} connection(s) still open after drain period",
            connections.len()
        );
        connections.abort_all();
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    mut draining: watch::Receiver<bool>,
) {
    let service = service_fn(move |req| {
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.route(req, peer).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = draining.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!("connection from {peer} closed with error: {e}");
    }
}
