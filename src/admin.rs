use crate::auth::extract_bearer;
use crate::state::GatewayState;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("cache-control", "no-store")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Read-only admin API: liveness, version and backend status
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Option<Arc<String>>,
}

impl AdminServer {
    /// Without a token, `/backends` refuses every request
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<GatewayState>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            auth_token: auth_token.map(Arc::new),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");
        if self.auth_token.is_none() {
            warn!("No admin token configured, /backends is disabled");
        }

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let auth_token = self.auth_token.clone();

                            tokio::spawn(async move {
                                let served =
                                    serve_admin_connection(stream, state, auth_token).await;
                                if let Err(e) = served {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    state: Arc<GatewayState>,
    auth_token: Option<Arc<String>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let token = auth_token.clone();
        async move { handle_admin_request(req, state, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return false;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(extract_bearer)
        .map(|token| token == expected)
        .unwrap_or(false)
}

/// Status of every endpoint in the current pool, plus pool counters
pub fn backends_report(state: &GatewayState) -> serde_json::Value {
    let pool = state.backends().snapshot();
    let stats = state.pool().stats();

    let backend_list: Vec<serde_json::Value> = pool
        .endpoints()
        .iter()
        .map(|e| {
            serde_json::json!({
                "name": e.name(),
                "address": e.address(),
                "up": e.is_up(),
                "active_connections": e.active_connections(),
                "total_requests": e.total_requests(),
                "max_connections": e.max_connections(),
            })
        })
        .collect();

    serde_json::json!({
        "strategy": pool.strategy().as_str(),
        "count": backend_list.len(),
        "healthy": pool.healthy_count(),
        "backends": backend_list,
        "pool": {
            "requests": stats.get_total_requests(),
            "connect_failures": stats.get_connect_failures(),
            "retries": stats.get_retries(),
            "health_checks": stats.get_health_checks(),
        },
    })
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    auth_token: Option<Arc<String>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // List backends and their status: GET /backends (auth required)
        (&Method::GET, "/backends") => {
            if !check_auth(&req, auth_token.as_deref().map(String::as_str)) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                json_response(StatusCode::OK, backends_report(&state).to_string())
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config};
    use crate::loadbalancer::ConnectionGuard;

    #[tokio::test]
    async fn test_backends_report() {
        let mut config = Config::default();
        config.auth.tokens = vec!["k".to_string()];
        config.backends = vec![
            BackendConfig::new("10.0.0.1", 11434).with_name("gpu-a"),
            BackendConfig::new("10.0.0.2", 11434).with_max_connections(4),
        ];
        let state = GatewayState::from_config(&config, None).unwrap();

        let pool = state.backends().snapshot();
        pool.endpoints()[1].set_up(false);
        let _guard = ConnectionGuard::new(Arc::clone(&pool.endpoints()[0]));

        let report = backends_report(&state);
        assert_eq!(report["strategy"], "least-connections");
        assert_eq!(report["count"], 2);
        assert_eq!(report["healthy"], 1);
        assert_eq!(report["backends"][0]["name"], "gpu-a");
        assert_eq!(report["backends"][0]["active_connections"], 1);
        assert_eq!(report["backends"][1]["address"], "10.0.0.2:11434");
        assert_eq!(report["backends"][1]["up"], false);
        assert_eq!(report["backends"][1]["max_connections"], 4);
        assert_eq!(report["pool"]["retries"], 0);
    }
}
