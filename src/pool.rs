//! Connection pool for backend HTTP connections
//!
//! Keep-alive HTTP/1.1 connections are reused per backend host to amortize
//! connection setup across requests.

use crate::body::DeferredBody;
use crate::loadbalancer::Endpoint;
use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// The TCP connection to the backend could not be established, so no
    /// part of the request was written
    pub fn is_connect(&self) -> bool {
        match self {
            PoolError::Client(e) => e.is_connect(),
            PoolError::RequestBuild(_) => false,
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent through the pool
    pub total_requests: AtomicU64,
    /// Requests whose connection attempt failed
    pub connect_failures: AtomicU64,
    /// Requests sent again to another backend after a connect failure
    pub retries: AtomicU64,
    /// Total number of health check requests
    pub health_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    pub fn get_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Method, target and headers of a request about to be forwarded.
///
/// Kept apart from the body so the same request can be rebuilt for a second
/// backend.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
}

/// Absolute URI of `path_and_query` on `endpoint`
pub fn backend_uri(endpoint: &Endpoint, path_and_query: &str) -> Result<Uri, PoolError> {
    let host = endpoint.host();
    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, endpoint.port())
    } else {
        format!("{}:{}", host, endpoint.port())
    };
    format!("http://{}{}", authority, path_and_query)
        .parse::<Uri>()
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, DeferredBody>,
    /// Dedicated client for health checks (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request through the connection pool.
    ///
    /// Resolves once the backend's response head has arrived; the body is
    /// streamed by the caller.
    pub async fn send_request(
        &self,
        head: &RequestHead,
        endpoint: &Endpoint,
        body: DeferredBody,
    ) -> Result<Response<Incoming>, PoolError> {
        let uri = backend_uri(endpoint, &head.path_and_query)?;

        let mut backend_req = Request::builder()
            .method(head.method.clone())
            .uri(uri)
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        *backend_req.headers_mut() = head.headers.clone();

        self.stats.record_request();

        match self.client.request(backend_req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_connect() {
                    self.stats.record_connect_failure();
                }
                Err(e.into())
            }
        }
    }

    /// Check if a backend answers `GET path` with a 2xx status
    pub async fn check_backend(&self, endpoint: &Endpoint, path: &str) -> bool {
        let uri = match backend_uri(endpoint, path) {
            Ok(uri) => uri,
            Err(_) => return false,
        };

        let req = match Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_health_check();

        match self.health_client.request(req).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{is_length_limit_error, BodySlot};
    use crate::config::{BackendConfig, BalancerConfig};
    use crate::error::ProxyBody;
    use http_body_util::{BodyExt, Full, Limited};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn post_head() -> RequestHead {
        RequestHead {
            method: Method::POST,
            path_and_query: "/api/generate".to_string(),
            headers: HeaderMap::new(),
        }
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();

        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_health_checks(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_connect_failure();
        stats.record_retry();
        stats.record_health_check();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_connect_failures(), 1);
        assert_eq!(stats.get_retries(), 1);
        assert_eq!(stats.get_health_checks(), 1);
    }

    #[test]
    fn test_backend_uri() {
        let balancer = BalancerConfig::default();
        let v4 = Endpoint::new(&BackendConfig::new("10.0.0.7", 11434), &balancer);
        assert_eq!(
            backend_uri(&v4, "/api/generate?x=1").unwrap().to_string(),
            "http://10.0.0.7:11434/api/generate?x=1"
        );

        let v6 = Endpoint::new(&BackendConfig::new("::1", 8000), &balancer);
        assert_eq!(
            backend_uri(&v6, "/").unwrap().to_string(),
            "http://[::1]:8000/"
        );
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(250),
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
        assert_eq!(pool.stats().get_total_requests(), 0);
    }

    #[tokio::test]
    async fn test_check_backend_unreachable() {
        let port = unused_port().await;

        let pool = ConnectionPool::new(PoolConfig::default());
        let endpoint = Endpoint::new(
            &BackendConfig::new("127.0.0.1", port),
            &BalancerConfig::default(),
        );
        assert!(!pool.check_backend(&endpoint, "/").await);
        assert_eq!(pool.stats().get_health_checks(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_body_unsent() {
        let port = unused_port().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let endpoint = Endpoint::new(
            &BackendConfig::new("127.0.0.1", port),
            &BalancerConfig::default(),
        );

        let body: ProxyBody = Full::new(Bytes::from("{\"prompt\":\"hi\"}"))
            .map_err(|e| match e {})
            .boxed();
        let slot = BodySlot::new(body);

        let err = pool
            .send_request(&post_head(), &endpoint, slot.deferred())
            .await
            .unwrap_err();
        assert!(err.is_connect());
        assert!(slot.is_unsent());
        assert_eq!(pool.stats().get_connect_failures(), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_surfaces_length_limit_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let pool = ConnectionPool::new(PoolConfig::default());
        let endpoint = Endpoint::new(
            &BackendConfig::new("127.0.0.1", port),
            &BalancerConfig::default(),
        );
        let body = Limited::new(Full::new(Bytes::from(vec![b'x'; 4096])), 1024).boxed();
        let slot = BodySlot::new(body);

        let err = pool
            .send_request(&post_head(), &endpoint, slot.deferred())
            .await
            .unwrap_err();
        assert!(!err.is_connect());
        assert!(is_length_limit_error(&err));
    }
}
