//! Health check system for backend endpoints
//!
//! Periodically probes every endpoint of the current backend pool and flips
//! its up/down flag with hysteresis, so a single lost probe does not take a
//! backend out of rotation.

use crate::config::{HealthConfig, ProbeKind};
use crate::loadbalancer::Endpoint;
use crate::state::GatewayState;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Thresholds for flipping an endpoint's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Consecutive failures before marking down
    pub failure: u32,
    /// Consecutive successes before marking up
    pub success: u32,
}

impl From<&HealthConfig> for Thresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            failure: config.unhealthy_threshold,
            success: config.healthy_threshold,
        }
    }
}

/// Tracks consecutive probe results for an endpoint
#[derive(Debug, Clone)]
pub struct HealthState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    is_healthy: bool,
}

impl HealthState {
    pub fn new(is_healthy: bool) -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            is_healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }

    /// Feed one probe result; returns the new state when it flips
    pub fn record(&mut self, passed: bool, thresholds: Thresholds) -> Option<bool> {
        if passed {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;

            if !self.is_healthy && self.consecutive_successes >= thresholds.success {
                self.is_healthy = true;
                return Some(true);
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;

            if self.is_healthy && self.consecutive_failures >= thresholds.failure {
                self.is_healthy = false;
                return Some(false);
            }
        }
        None
    }
}

/// Health checker that monitors backend endpoints
pub struct HealthChecker {
    state: Arc<GatewayState>,
    config: HealthConfig,
    shutdown_rx: watch::Receiver<bool>,
    /// Keyed by `host:port`, so state survives a reload that keeps the endpoint
    health_states: HashMap<String, HealthState>,
}

impl HealthChecker {
    pub fn new(
        state: Arc<GatewayState>,
        config: HealthConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            config,
            shutdown_rx,
            health_states: HashMap::new(),
        }
    }

    /// Run the health checker
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval_ms,
            probe = ?self.config.probe,
            unhealthy_threshold = self.config.unhealthy_threshold,
            healthy_threshold = self.config.healthy_threshold,
            "Health checker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {
                    self.check_all_endpoints().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every endpoint of the current pool once, concurrently
    pub async fn check_all_endpoints(&mut self) {
        let pool = self.state.backends().snapshot();
        let endpoints = pool.endpoints();

        let results = join_all(endpoints.iter().map(|endpoint| self.probe(endpoint))).await;
        let thresholds = Thresholds::from(&self.config);

        for (endpoint, passed) in endpoints.iter().zip(results) {
            let state = self
                .health_states
                .entry(endpoint.address().to_string())
                .or_insert_with(|| HealthState::new(endpoint.is_up()));

            match state.record(passed, thresholds) {
                Some(true) => {
                    endpoint.set_up(true);
                    info!(
                        backend = %endpoint.name(),
                        address = %endpoint.address(),
                        "Backend is now healthy"
                    );
                }
                Some(false) => {
                    endpoint.set_up(false);
                    warn!(
                        backend = %endpoint.name(),
                        address = %endpoint.address(),
                        failures = thresholds.failure,
                        "Backend is now unhealthy"
                    );
                }
                None => {}
            }
        }

        // Clean up health states for endpoints that no longer exist
        let current: HashSet<&str> = endpoints.iter().map(|e| e.address()).collect();
        self.health_states
            .retain(|address, _| current.contains(address.as_str()));
    }

    async fn probe(&self, endpoint: &Endpoint) -> bool {
        match self.config.probe {
            ProbeKind::Tcp => check_tcp(endpoint.address(), self.config.timeout()).await,
            ProbeKind::Http => {
                let check = self.state.pool().check_backend(endpoint, &self.config.path);
                match tokio::time::timeout(self.config.timeout(), check).await {
                    Ok(passed) => {
                        debug!(address = %endpoint.address(), passed, "HTTP health check");
                        passed
                    }
                    Err(_) => {
                        debug!(address = %endpoint.address(), "Health check failed (timeout)");
                        false
                    }
                }
            }
        }
    }
}

/// Check if a backend is reachable by establishing a TCP connection
async fn check_tcp(address: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => {
            debug!(address, "Health check passed (TCP connect)");
            true
        }
        Ok(Err(e)) => {
            debug!(address, error = %e, "Health check failed (connection error)");
            false
        }
        Err(_) => {
            debug!(address, "Health check failed (timeout)");
            false
        }
    }
}
