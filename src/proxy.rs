use crate::accesslog::{RequestLog, RequestState};
use crate::auth::{authorize, AuthDecision};
use crate::body::{is_length_limit_error, BodySlot, TrackedBody};
use crate::error::{BoxError, GatewayError, ProxyBody};
use crate::loadbalancer::{ConnectionGuard, Endpoint};
use crate::pool::{PoolError, RequestHead};
use crate::state::GatewayState;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for the immediate client address
const X_REAL_IP: &str = "x-real-ip";
/// Tells buffering intermediaries (nginx and friends) to pass chunks through
const X_ACCEL_BUFFERING: &str = "x-accel-buffering";

/// Headers meaningful only for a single transport hop
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
    /// How long open connections get to finish after shutdown is signalled
    drain_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<GatewayState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gateway listening (HTTP/1.1 and h2c)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let conn_shutdown = self.shutdown_rx.clone();
                            connections.spawn(async move {
                                let served =
                                    handle_connection(stream, addr, state, conn_shutdown).await;
                                if let Err(e) = served {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shut down
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        if !connections.is_empty() {
            info!(
                connections = connections.len(),
                timeout_secs = self.drain_timeout.as_secs(),
                "Draining open connections"
            );
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    connections = connections.len(),
                    "Drain timeout elapsed, closing remaining connections"
                );
                connections.abort_all();
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<GatewayState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
        _ = shutdown_rx.changed() => {
            // Finish in-flight requests, refuse new ones on this connection
            conn.as_mut().graceful_shutdown();
            conn.await
                .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut log = RequestLog::new(
        client_addr,
        req.method(),
        req.uri(),
        req.version(),
        &request_id,
    );

    log.advance(RequestState::Authorizing);
    let auth_header = req.headers().get(header::AUTHORIZATION);
    log.set_credential_presented(auth_header.is_some());

    // Snapshot taken on arrival; a reload mid-request does not affect it
    let credentials = state.credentials().snapshot();
    match authorize(&credentials, auth_header) {
        AuthDecision::Authorized => {
            log.advance(RequestState::Authorized);
        }
        AuthDecision::Rejected(reason) => {
            debug!(request_id, reason = reason.as_str(), "Rejected unauthorized request");
            return Ok(reject(&mut log, RequestState::Rejected, GatewayError::Unauthorized));
        }
    }
    drop(credentials);

    let limits = state.limits();
    if declared_length(req.headers()).is_some_and(|len| len > limits.max_body_bytes) {
        debug!(request_id, limit = limits.max_body_bytes, "Declared body length over limit");
        return Ok(reject(
            &mut log,
            RequestState::TooLarge,
            GatewayError::BodyTooLarge {
                limit: limits.max_body_bytes,
            },
        ));
    }

    let (parts, body) = req.into_parts();
    let original_host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()));

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    add_forwarding_headers(&mut headers, client_addr, original_host.as_deref(), &request_id);

    let head = RequestHead {
        method: parts.method,
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers,
    };

    // hyper holds a body with a known length to it, so only bodies of unknown
    // length are read up front, where they can be refused before any backend
    // is contacted
    let limit = usize::try_from(limits.max_body_bytes).unwrap_or(usize::MAX);
    let body: ProxyBody = if body.size_hint().exact().is_some() {
        Limited::new(body, limit).boxed()
    } else {
        match Limited::new(body, limit).collect().await {
            Ok(collected) => Full::new(collected.to_bytes()).map_err(|e| match e {}).boxed(),
            Err(e) if is_length_limit_error(e.as_ref()) => {
                debug!(request_id, limit = limits.max_body_bytes, "Streamed body exceeded limit");
                return Ok(reject(
                    &mut log,
                    RequestState::TooLarge,
                    GatewayError::BodyTooLarge {
                        limit: limits.max_body_bytes,
                    },
                ));
            }
            Err(e) => {
                debug!(request_id, error = %e, "Failed to read request body");
                return Ok(reject(
                    &mut log,
                    RequestState::ClientAborted,
                    GatewayError::BodyRead { source: e },
                ));
            }
        }
    };
    let slot = BodySlot::new(body);

    log.advance(RequestState::SelectingBackend);
    let backends = state.backends().snapshot();
    let mut endpoint = match backends.select(None) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(
                request_id,
                backends = backends.len(),
                healthy = backends.healthy_count(),
                "No backend available"
            );
            return Ok(reject(&mut log, RequestState::NoBackend, e));
        }
    };
    let mut retried = false;

    loop {
        let guard = match endpoint.dispatch(limits.queue_timeout).await {
            Ok(guard) => guard,
            Err(e) => return Ok(reject(&mut log, RequestState::NoBackend, e)),
        };
        log.advance(RequestState::Dispatched);
        log.set_backend(endpoint.address());

        let result = tokio::time::timeout(
            limits.response_timeout,
            state.pool().send_request(&head, &endpoint, slot.deferred()),
        )
        .await;

        let err = match result {
            Ok(Ok(response)) => return Ok(relay_response(response, guard, log)),
            Ok(Err(e)) => e,
            Err(_) => {
                drop(guard);
                warn!(
                    request_id,
                    backend = %endpoint.address(),
                    timeout_secs = limits.response_timeout.as_secs(),
                    "Backend response timed out"
                );
                let e = GatewayError::BackendTimeout {
                    backend: endpoint.address().to_string(),
                    timeout: limits.response_timeout,
                };
                return Ok(reject(&mut log, RequestState::BackendFailed, e));
            }
        };
        drop(guard);

        // Retry at most once, only if the body was never handed over
        if err.is_connect() && !retried && slot.is_unsent() {
            if let Ok(next) = backends.select(Some(endpoint.address())) {
                warn!(
                    request_id,
                    failed = %endpoint.address(),
                    retry = %next.address(),
                    error = %err,
                    "Backend connect failed, retrying on another backend"
                );
                state.pool().stats().record_retry();
                log.advance(RequestState::SelectingBackend);
                retried = true;
                endpoint = next;
                continue;
            }
        }

        return Ok(upstream_failure(&mut log, &request_id, &endpoint, err, limits.max_body_bytes));
    }
}

/// Answer with an error response and close out the request in `terminal`
fn reject(
    log: &mut RequestLog,
    terminal: RequestState,
    error: GatewayError,
) -> Response<ProxyBody> {
    let response = error.into_response();
    let bytes = response.body().size_hint().exact().unwrap_or(0);
    log.finish(terminal, response.status().as_u16(), bytes, false);
    response
}

fn upstream_failure(
    log: &mut RequestLog,
    request_id: &str,
    endpoint: &Endpoint,
    err: PoolError,
    max_body_bytes: u64,
) -> Response<ProxyBody> {
    if is_length_limit_error(&err) {
        debug!(request_id, limit = max_body_bytes, "Request body exceeded limit while streaming");
        return reject(
            log,
            RequestState::TooLarge,
            GatewayError::BodyTooLarge {
                limit: max_body_bytes,
            },
        );
    }

    // Log detailed error internally, return generic message externally
    error!(
        request_id,
        backend = %endpoint.address(),
        error = %err,
        "Failed to forward request"
    );
    let backend = endpoint.address().to_string();
    let connect = err.is_connect();
    let source: BoxError = Box::new(err);
    let e = if connect {
        GatewayError::BackendConnect { backend, source }
    } else {
        GatewayError::BadGateway { backend, source }
    };
    reject(log, RequestState::BackendFailed, e)
}

/// Hand the backend's response to the client as it arrives
fn relay_response(
    response: Response<Incoming>,
    guard: ConnectionGuard,
    mut log: RequestLog,
) -> Response<ProxyBody> {
    log.advance(RequestState::Streaming);

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    apply_streaming_headers(&mut parts.headers);
    if let Ok(value) = HeaderValue::from_str(log.request_id()) {
        parts.headers.insert(X_REQUEST_ID, value);
    }

    debug!(
        request_id = %log.request_id(),
        status = parts.status.as_u16(),
        backend = %guard.endpoint().address(),
        "Streaming backend response"
    );

    let status = parts.status.as_u16();
    let inner = body.map_err(|e| Box::new(e) as BoxError).boxed();
    let body = TrackedBody::new(inner, guard, log, status);
    Response::from_parts(parts, body.boxed())
}

/// Content-Length as sent by the client, if present and well formed
fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Add forwarding metadata.
///
/// The client address is appended to `X-Forwarded-For`. Proto, host and
/// real-IP values already set by an upstream layer are left alone.
pub fn add_forwarding_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    original_host: Option<&str>,
    request_id: &str,
) {
    let client_ip = client_addr.ip().to_string();

    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client_ip.clone()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(value) = original_host.and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }

    if !headers.contains_key(X_REAL_IP) {
        if let Ok(value) = HeaderValue::from_str(&client_ip) {
            headers.insert(X_REAL_IP, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
}

/// Response headers that keep the stream uncached and unbuffered downstream
pub fn apply_streaming_headers(headers: &mut HeaderMap) {
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "192.0.2.10:54321".parse().unwrap()
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Session-Hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic Zm9v"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("authorization", HeaderValue::from_static("Bearer k1"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("authorization"));
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_forwarding_headers_fresh() {
        let mut headers = HeaderMap::new();
        add_forwarding_headers(&mut headers, client(), Some("gateway.local:8080"), "req-1");

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.0.2.10");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "gateway.local:8080");
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "192.0.2.10");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
    }

    #[test]
    fn test_forwarding_headers_keep_upstream_values() {
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.5"));
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.7"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        headers.insert(X_FORWARDED_HOST, HeaderValue::from_static("api.example.com"));
        headers.insert(X_REAL_IP, HeaderValue::from_static("203.0.113.5"));

        add_forwarding_headers(&mut headers, client(), Some("gateway.local"), "req-2");

        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "203.0.113.5, 198.51.100.7, 192.0.2.10"
        );
        assert_eq!(headers.get_all(X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "api.example.com");
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "203.0.113.5");
    }

    #[test]
    fn test_streaming_headers() {
        let mut headers = HeaderMap::new();
        apply_streaming_headers(&mut headers);
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-store");
        assert_eq!(headers.get(X_ACCEL_BUFFERING).unwrap(), "no");

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=0"));
        apply_streaming_headers(&mut headers);
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "private, max-age=0");
    }

    #[test]
    fn test_declared_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_length(&headers), None);

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("1048576"));
        assert_eq!(declared_length(&headers), Some(1_048_576));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(declared_length(&headers), None);
    }
}
