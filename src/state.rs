//! Shared gateway state and configuration reload

use crate::auth::{CredentialSet, CredentialStore};
use crate::config::Config;
use crate::loadbalancer::{BackendPool, BackendRegistry};
use crate::pool::{ConnectionPool, PoolConfig};
use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Per-request limits, replaced together on reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_body_bytes: u64,
    pub response_timeout: Duration,
    pub queue_timeout: Duration,
}

impl RequestLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_body_bytes: config.server.max_body_bytes,
            response_timeout: config.server.response_timeout(),
            queue_timeout: config.balancer.queue_timeout(),
        }
    }
}

/// Summary of a successful reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub tokens: usize,
    pub backends: usize,
}

/// Everything a request handler needs, shared across all connections
pub struct GatewayState {
    credentials: CredentialStore,
    backends: BackendRegistry,
    limits: ArcSwap<RequestLimits>,
    pool: Arc<ConnectionPool>,
}

impl GatewayState {
    /// Build the initial state. `base_dir` resolves a relative tokens file.
    pub fn from_config(config: &Config, base_dir: Option<&Path>) -> anyhow::Result<Self> {
        let tokens = config.auth.load_tokens(base_dir)?;
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: config.server.pool_idle_timeout(),
            connect_timeout: config.server.connect_timeout(),
        });

        Ok(Self {
            credentials: CredentialStore::new(CredentialSet::new(tokens)),
            backends: BackendRegistry::new(BackendPool::from_config(
                &config.backends,
                &config.balancer,
            )),
            limits: ArcSwap::from_pointee(RequestLimits::from_config(config)),
            pool: Arc::new(pool),
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn limits(&self) -> Arc<RequestLimits> {
        self.limits.load_full()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Swap in credentials, backends and limits from a freshly loaded config.
    ///
    /// Everything that can fail runs before the first swap, so an error
    /// leaves the running state untouched. Requests already in flight keep
    /// the snapshots they started with.
    pub fn reload(
        &self,
        config: &Config,
        base_dir: Option<&Path>,
    ) -> anyhow::Result<ReloadSummary> {
        config.validate()?;
        let tokens = config.auth.load_tokens(base_dir)?;

        let pool_config = self.pool.config();
        if pool_config.max_idle_per_host != config.server.pool_max_idle_per_host
            || pool_config.idle_timeout != config.server.pool_idle_timeout()
            || pool_config.connect_timeout != config.server.connect_timeout()
        {
            warn!("Connection pool settings changed; they take effect after a restart");
        }

        let summary = ReloadSummary {
            tokens: tokens.len(),
            backends: config.backends.len(),
        };

        self.credentials.replace(CredentialSet::new(tokens));
        self.backends.reload(&config.backends, &config.balancer);
        self.limits.store(Arc::new(RequestLimits::from_config(config)));

        info!(
            tokens = summary.tokens,
            backends = summary.backends,
            "Configuration reloaded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn config(tokens: &[&str], backends: &[u16]) -> Config {
        let mut config = Config::default();
        config.auth.tokens = tokens.iter().map(|t| t.to_string()).collect();
        config.backends = backends
            .iter()
            .map(|port| BackendConfig::new("127.0.0.1", *port))
            .collect();
        config
    }

    #[tokio::test]
    async fn test_from_config() {
        let state = GatewayState::from_config(&config(&["k1", "k2"], &[9001, 9002]), None).unwrap();
        assert_eq!(state.credentials().snapshot().len(), 2);
        assert_eq!(state.backends().snapshot().len(), 2);
        assert_eq!(state.limits().max_body_bytes, 100 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_reload_swaps_everything() {
        let state = GatewayState::from_config(&config(&["old"], &[9001]), None).unwrap();
        let before = state.credentials().snapshot();

        let mut next = config(&["new-a", "new-b"], &[9001, 9002, 9003]);
        next.server.max_body_bytes = 1024;
        let summary = state.reload(&next, None).unwrap();

        assert_eq!(summary, ReloadSummary { tokens: 2, backends: 3 });
        assert!(state.credentials().snapshot().contains("new-a"));
        assert!(!state.credentials().snapshot().contains("old"));
        assert_eq!(state.backends().snapshot().len(), 3);
        assert_eq!(state.limits().max_body_bytes, 1024);

        // A request holding the old snapshot still sees the old set
        assert!(before.contains("old"));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_state() {
        let state = GatewayState::from_config(&config(&["keep"], &[9001]), None).unwrap();

        // No backends is a validation error
        assert!(state.reload(&config(&["other"], &[]), None).is_err());

        let mut missing_file = config(&["other"], &[9002]);
        missing_file.auth.tokens_file = Some("/nonexistent/infergate-tokens".into());
        assert!(state.reload(&missing_file, None).is_err());

        assert!(state.credentials().snapshot().contains("keep"));
        assert_eq!(state.backends().snapshot().endpoints()[0].port(), 9001);
    }
}
