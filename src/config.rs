use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, connection pool and timeout settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Accepted bearer tokens
    #[serde(default)]
    pub auth: AuthConfig,

    /// Backend selection policy
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Out-of-band health probing
    #[serde(default)]
    pub health: HealthConfig,

    /// Log level and destinations
    #[serde(default)]
    pub log: LogConfig,

    /// Backend endpoints, in selection tie-break order
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gateway port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the loopback admin API (default: 9901, set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Token required by the admin API's status endpoints.
    /// If not set, `/backends` refuses every request
    pub admin_token: Option<String>,

    /// Largest accepted request body in bytes (default: 100 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Maximum idle connections kept per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// TCP connect timeout towards a backend in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Deadline for a backend to produce response headers, in seconds (default: 300)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Time given to in-flight connections on shutdown, in seconds (default: 30)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            max_body_bytes: default_max_body_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Tokens listed inline
    #[serde(default)]
    pub tokens: Vec<String>,

    /// File with one token per line; blank lines and `#` comments are skipped
    pub tokens_file: Option<PathBuf>,
}

impl AuthConfig {
    /// Collect inline and file tokens into one set.
    ///
    /// A relative `tokens_file` is resolved against `base_dir`, usually the
    /// directory holding the configuration file.
    pub fn load_tokens(&self, base_dir: Option<&Path>) -> anyhow::Result<HashSet<String>> {
        let mut tokens: HashSet<String> = self
            .tokens
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if let Some(ref file) = self.tokens_file {
            let path = match base_dir {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            let content = std::fs::read_to_string(&path).map_err(|e| {
                anyhow::anyhow!("Failed to read tokens file '{}': {}", path.display(), e)
            })?;
            tokens.extend(parse_token_lines(&content));
        }

        Ok(tokens)
    }
}

fn parse_token_lines(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
}

/// Load balancing strategy
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Fewest live connections, ties broken by configuration order
    #[default]
    #[serde(alias = "least_conn", alias = "least-conn")]
    LeastConnections,
    /// Rotate over healthy backends
    #[serde(alias = "round_robin")]
    RoundRobin,
    /// Pick a healthy backend at random
    Random,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LeastConnections => "least-connections",
            Strategy::RoundRobin => "round-robin",
            Strategy::Random => "random",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BalancerConfig {
    #[serde(default)]
    pub strategy: Strategy,

    /// Cap on concurrent requests per backend (default: unlimited)
    pub max_connections_per_backend: Option<usize>,

    /// How long a request may wait for a slot on a capped backend, in milliseconds
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
}

impl BalancerConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_connections_per_backend: None,
            queue_timeout_ms: default_queue_timeout(),
        }
    }
}

/// How a health probe decides that a backend is alive
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// A TCP connection can be established
    #[default]
    Tcp,
    /// `GET <path>` answers with a 2xx status
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Probe backends periodically (default: false, all backends stay up)
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub probe: ProbeKind,

    /// Path used by HTTP probes
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Interval between probe rounds in milliseconds
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Timeout for a single probe in milliseconds
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// Consecutive failures before a backend is marked down
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive successes before a down backend is marked up again
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probe: ProbeKind::default(),
            path: default_health_path(),
            interval_ms: default_health_interval(),
            timeout_ms: default_health_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write access records to this file instead of stdout
    pub access_log: Option<PathBuf>,

    /// Also write warnings and errors to this file
    pub error_log: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            access_log: None,
            error_log: None,
        }
    }
}

/// A single backend endpoint
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Hostname or IP address
    pub host: String,

    /// Port (default: 11434)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Display name used in logs (default: host:port)
    pub name: Option<String>,

    /// Overrides `balancer.max_connections_per_backend`
    pub max_connections: Option<usize>,
}

impl BackendConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            name: None,
            max_connections: None,
        }
    }

    /// Set a display name (builder pattern)
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set a connection cap (builder pattern)
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.address())
    }

    pub fn max_connections(&self, balancer: &BalancerConfig) -> Option<usize> {
        self.max_connections.or(balancer.max_connections_per_backend)
    }

    /// Validate the backend configuration
    pub fn validate(&self, index: usize) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("Backend #{}: 'host' must not be empty", index));
        }
        if self.host.contains('/') || self.host.contains(' ') {
            return Err(format!(
                "Backend #{}: 'host' must be a bare hostname or IP, got '{}'",
                index, self.host
            ));
        }
        if self.port == 0 {
            return Err(format!(
                "Backend '{}': 'port' must be greater than 0",
                self.display_name()
            ));
        }
        if self.max_connections == Some(0) {
            return Err(format!(
                "Backend '{}': 'max_connections' must be greater than 0",
                self.display_name()
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_admin_port() -> u16 {
    9901
}

fn default_max_body_bytes() -> u64 {
    100 * 1024 * 1024 // large prompts
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_response_timeout() -> u64 {
    300 // model loading on a cold backend can take minutes
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_queue_timeout() -> u64 {
    30_000
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_health_interval() -> u64 {
    5000
}

fn default_health_timeout() -> u64 {
    3000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_log_level() -> String {
    "infergate=info".to_string()
}

fn default_backend_port() -> u16 {
    11434
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.backends.is_empty() {
            errors.push("At least one [[backends]] entry is required".to_string());
        }

        let mut seen = HashSet::new();
        for (index, backend) in self.backends.iter().enumerate() {
            if let Err(e) = backend.validate(index) {
                errors.push(e);
            }
            if !seen.insert(backend.address()) {
                errors.push(format!("Backend '{}' is listed more than once", backend.address()));
            }
        }

        if self.auth.tokens.is_empty() && self.auth.tokens_file.is_none() {
            errors.push(
                "No credentials configured: set auth.tokens or auth.tokens_file".to_string(),
            );
        }

        if self.server.max_body_bytes == 0 {
            errors.push("server.max_body_bytes must be greater than 0".to_string());
        }

        if self.balancer.max_connections_per_backend == Some(0) {
            errors.push("balancer.max_connections_per_backend must be greater than 0".to_string());
        }

        if self.health.enabled {
            if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
                errors.push("health thresholds must be greater than 0".to_string());
            }
            if self.health.interval_ms == 0 {
                errors.push("health.interval_ms must be greater than 0".to_string());
            }
            if self.health.probe == ProbeKind::Http && !self.health.path.starts_with('/') {
                errors.push(format!("health.path must start with '/', got '{}'", self.health.path));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 11000
bind = "127.0.0.1"
max_body_bytes = 1048576

[auth]
tokens = ["alpha", "beta"]

[balancer]
strategy = "round-robin"
max_connections_per_backend = 4

[health]
enabled = true
probe = "http"
path = "/api/version"
unhealthy_threshold = 2
healthy_threshold = 1

[[backends]]
host = "10.0.0.1"
name = "gpu-a"

[[backends]]
host = "10.0.0.2"
port = 8000
max_connections = 1
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 11000);
        assert_eq!(config.server.max_body_bytes, 1048576);
        assert_eq!(config.auth.tokens, vec!["alpha", "beta"]);
        assert_eq!(config.balancer.strategy, Strategy::RoundRobin);
        assert_eq!(config.health.probe, ProbeKind::Http);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].port, 11434);
        assert_eq!(config.backends[0].display_name(), "gpu-a");
        assert_eq!(config.backends[1].display_name(), "10.0.0.2:8000");
        assert_eq!(config.backends[0].max_connections(&config.balancer), Some(4));
        assert_eq!(config.backends[1].max_connections(&config.balancer), Some(1));
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.admin_port, 9901);
        assert_eq!(config.max_body_bytes, 100 * 1024 * 1024);
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.response_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_health_config() {
        let health = HealthConfig::default();
        assert!(!health.enabled);
        assert_eq!(health.probe, ProbeKind::Tcp);
        assert_eq!(health.interval(), Duration::from_secs(5));
        assert_eq!(health.timeout(), Duration::from_secs(3));
        assert_eq!(health.unhealthy_threshold, 3);
        assert_eq!(health.healthy_threshold, 2);
    }

    #[test]
    fn test_strategy_aliases() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: Strategy,
        }
        for (raw, expected) in [
            ("least-connections", Strategy::LeastConnections),
            ("least_conn", Strategy::LeastConnections),
            ("round_robin", Strategy::RoundRobin),
            ("random", Strategy::Random),
        ] {
            let w: Wrapper = toml::from_str(&format!("strategy = \"{}\"", raw)).unwrap();
            assert_eq!(w.strategy, expected, "{}", raw);
        }
    }

    #[test]
    fn test_validate_requires_backends_and_tokens() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("At least one [[backends]] entry is required"));
        assert!(err.contains("No credentials configured"));
    }

    #[test]
    fn test_validate_backend_errors() {
        let toml = r#"
[auth]
tokens = ["t"]

[[backends]]
host = "10.0.0.1"
port = 0

[[backends]]
host = "10.0.0.2"

[[backends]]
host = "10.0.0.2"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'port' must be greater than 0"));
        assert!(err.contains("'10.0.0.2:11434' is listed more than once"));
    }

    #[test]
    fn test_validate_rejects_url_as_host() {
        let backend = BackendConfig::new("http://10.0.0.1", 80);
        let err = backend.validate(0).unwrap_err();
        assert!(err.contains("bare hostname"));
    }

    #[test]
    fn test_load_tokens_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("keys.txt"),
            "# team keys\nkey-one\n\n  key-two  \n#disabled-key\n",
        )
        .unwrap();

        let auth = AuthConfig {
            tokens: vec!["inline".to_string(), "  ".to_string()],
            tokens_file: Some(PathBuf::from("keys.txt")),
        };
        let tokens = auth.load_tokens(Some(dir.path())).unwrap();

        assert_eq!(tokens.len(), 3);
        assert!(tokens.contains("inline"));
        assert!(tokens.contains("key-one"));
        assert!(tokens.contains("key-two"));
        assert!(!tokens.contains("#disabled-key"));
    }

    #[test]
    fn test_load_tokens_missing_file() {
        let auth = AuthConfig {
            tokens: vec![],
            tokens_file: Some(PathBuf::from("/nonexistent/keys.txt")),
        };
        let err = auth.load_tokens(None).unwrap_err().to_string();
        assert!(err.contains("Failed to read tokens file"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("infergate.toml");
        std::fs::write(
            &path,
            r#"
[auth]
tokens = ["secret"]

[[backends]]
host = "127.0.0.1"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backends[0].address(), "127.0.0.1:11434");
        assert_eq!(config.balancer.strategy, Strategy::LeastConnections);
    }
}
