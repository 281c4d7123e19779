//! Load balancer for distributing requests across backend endpoints
//!
//! Each [`Endpoint`] carries its liveness flag and a live-connection counter.
//! A [`BackendPool`] is an immutable snapshot of the configured endpoints;
//! the [`BackendRegistry`] swaps snapshots atomically on reload while
//! in-flight requests keep the endpoint they were dispatched to.

use crate::config::{BackendConfig, BalancerConfig, Strategy};
use crate::error::GatewayError;
use arc_swap::ArcSwap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// One backend instance
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    host: String,
    port: u16,
    address: String,
    up: AtomicBool,
    active: AtomicUsize,
    total_requests: AtomicU64,
    max_connections: Option<usize>,
    slots: Option<Arc<Semaphore>>,
}

impl Endpoint {
    pub fn new(config: &BackendConfig, balancer: &BalancerConfig) -> Self {
        let max_connections = config.max_connections(balancer);
        Self {
            name: config.display_name(),
            host: config.host.clone(),
            port: config.port,
            address: config.address(),
            up: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            max_connections,
            slots: max_connections.map(|max| Arc::new(Semaphore::new(max))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, the endpoint's identity across reloads
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Set liveness, returning the previous value
    pub fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::AcqRel)
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    pub fn has_capacity(&self) -> bool {
        self.max_connections
            .map_or(true, |max| self.active_connections() < max)
    }

    /// Claim a connection slot on this endpoint.
    ///
    /// Uncapped endpoints dispatch immediately. Capped ones wait up to
    /// `queue_timeout` for a slot and fail with `PoolExhausted` otherwise.
    pub async fn dispatch(
        self: &Arc<Self>,
        queue_timeout: Duration,
    ) -> Result<ConnectionGuard, GatewayError> {
        let permit = match self.slots {
            Some(ref slots) => {
                let acquire = Arc::clone(slots).acquire_owned();
                match tokio::time::timeout(queue_timeout, acquire).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(GatewayError::PoolExhausted),
                    Err(_) => {
                        warn!(
                            backend = %self.name,
                            waited_ms = queue_timeout.as_millis() as u64,
                            "Timed out waiting for a backend connection slot"
                        );
                        return Err(GatewayError::PoolExhausted);
                    }
                }
            }
            None => None,
        };
        Ok(ConnectionGuard::with_permit(Arc::clone(self), permit))
    }
}

/// Live connection on an endpoint.
///
/// The counter is incremented on creation and decremented on drop, so every
/// exit path of a request (completion, error, client abort, unwind) releases
/// it exactly once.
#[derive(Debug)]
pub struct ConnectionGuard {
    endpoint: Arc<Endpoint>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self::with_permit(endpoint, None)
    }

    fn with_permit(endpoint: Arc<Endpoint>, permit: Option<OwnedSemaphorePermit>) -> Self {
        endpoint.active.fetch_add(1, Ordering::AcqRel);
        endpoint.total_requests.fetch_add(1, Ordering::Relaxed);
        Self {
            endpoint,
            _permit: permit,
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.endpoint.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Immutable snapshot of the configured endpoints
#[derive(Debug)]
pub struct BackendPool {
    endpoints: Vec<Arc<Endpoint>>,
    strategy: Strategy,
    round_robin_index: AtomicUsize,
}

impl BackendPool {
    pub fn new(endpoints: Vec<Arc<Endpoint>>, strategy: Strategy) -> Self {
        Self {
            endpoints,
            strategy,
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub fn from_config(backends: &[BackendConfig], balancer: &BalancerConfig) -> Self {
        let endpoints = backends
            .iter()
            .map(|b| Arc::new(Endpoint::new(b, balancer)))
            .collect();
        Self::new(endpoints, balancer.strategy)
    }

    /// Build the pool for a new configuration.
    ///
    /// Endpoints whose address and cap are unchanged are carried over with
    /// their counters and liveness; changed ones inherit liveness only.
    pub fn rebuild(&self, backends: &[BackendConfig], balancer: &BalancerConfig) -> Self {
        let endpoints = backends
            .iter()
            .map(|config| {
                let fresh = Endpoint::new(config, balancer);
                match self.find(&fresh.address) {
                    Some(existing)
                        if existing.max_connections == fresh.max_connections
                            && existing.name == fresh.name =>
                    {
                        Arc::clone(existing)
                    }
                    Some(existing) => {
                        fresh.set_up(existing.is_up());
                        Arc::new(fresh)
                    }
                    None => Arc::new(fresh),
                }
            })
            .collect();
        Self::new(endpoints, balancer.strategy)
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn find(&self, address: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.address == address)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_up()).count()
    }

    /// Pick the endpoint for the next request.
    ///
    /// Only endpoints marked up are eligible, and `exclude` (an address) is
    /// skipped. Endpoints with a free slot are preferred; when every eligible
    /// endpoint is at its cap, one is still returned and the request queues
    /// for a slot in [`Endpoint::dispatch`].
    pub fn select(&self, exclude: Option<&str>) -> Result<Arc<Endpoint>, GatewayError> {
        let eligible: Vec<&Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.is_up() && Some(e.address()) != exclude)
            .collect();

        if eligible.is_empty() {
            return Err(GatewayError::PoolExhausted);
        }

        let with_capacity: Vec<&Arc<Endpoint>> =
            eligible.iter().copied().filter(|e| e.has_capacity()).collect();
        let candidates = if with_capacity.is_empty() {
            eligible
        } else {
            with_capacity
        };

        let selected = match self.strategy {
            Strategy::LeastConnections => {
                // min_by_key keeps the first minimum, so ties go to configuration order
                candidates
                    .iter()
                    .copied()
                    .min_by_key(|e| e.active_connections())
            }
            Strategy::RoundRobin => {
                let idx =
                    self.round_robin_index.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(candidates[idx])
            }
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[idx])
            }
        };

        let selected = selected.ok_or(GatewayError::PoolExhausted)?;
        debug!(
            backend = %selected.name,
            active = selected.active_connections(),
            strategy = self.strategy.as_str(),
            "Selected backend"
        );
        Ok(Arc::clone(selected))
    }
}

/// Holder of the active backend pool, swapped wholesale on reload
#[derive(Debug)]
pub struct BackendRegistry {
    current: ArcSwap<BackendPool>,
}

impl BackendRegistry {
    pub fn new(pool: BackendPool) -> Self {
        Self {
            current: ArcSwap::from_pointee(pool),
        }
    }

    pub fn snapshot(&self) -> Arc<BackendPool> {
        self.current.load_full()
    }

    /// Replace the pool with one built from `backends`, keeping state of
    /// endpoints that survive
    pub fn reload(&self, backends: &[BackendConfig], balancer: &BalancerConfig) {
        let next = self.current.load().rebuild(backends, balancer);
        info!(
            backends = next.len(),
            strategy = next.strategy().as_str(),
            "Backend pool replaced"
        );
        self.current.store(Arc::new(next));
    }
}
