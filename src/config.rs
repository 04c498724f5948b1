use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the front door
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// TLS listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Liveness probing
    #[serde(default)]
    pub health: HealthConfig,

    /// Upstream forwarding
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Reserved path prefix routed to the form submission service
    #[serde(default)]
    pub submission: SubmissionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTPS port (default: 443)
    #[serde(default = "default_https_port")]
    pub port: u16,

    /// Path to TLS certificate chain (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key (PEM format)
    pub tls_key: Option<String>,

    /// How long open connections may keep finishing requests after shutdown starts
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl ServerConfig {
    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.bind, self.port, e))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_https_port(),
            tls_cert: None,
            tls_key: None,
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Configuration for the worker processes
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// supervisor. Keep the configuration file readable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Command that starts one worker
    #[serde(default)]
    pub command: String,

    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Extra environment variables (PORT and WORKER_ID are always set)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Number of workers (default: available parallelism of the host)
    pub pool_size: Option<usize>,

    /// Worker N listens on base_port + N
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// A worker exiting sooner than this after spawn counts as a crash
    #[serde(default = "default_min_uptime")]
    pub min_uptime_ms: u64,

    /// First respawn delay after a crash
    #[serde(default = "default_restart_backoff_base")]
    pub restart_backoff_base_ms: u64,

    /// Upper bound for the respawn delay
    #[serde(default = "default_restart_backoff_max")]
    pub restart_backoff_max_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl WorkerConfig {
    /// Create a worker config running `command` with defaults for everything else
    pub fn local(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Configured pool size, falling back to the host's execution units
    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn restart_backoff_base(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_base_ms)
    }

    pub fn restart_backoff_max(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_max_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            pool_size: None,
            base_port: default_base_port(),
            min_uptime_ms: default_min_uptime(),
            restart_backoff_base_ms: default_restart_backoff_base(),
            restart_backoff_max_ms: default_restart_backoff_max(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Liveness endpoint path on every worker
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Delay before the first round of probes, lets the pool boot
    #[serde(default = "default_health_warmup")]
    pub warmup_ms: u64,

    /// Time between probe rounds
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Per-probe timeout
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// Failed probes only mark a worker unhealthy once this long has passed
    /// since its last successful probe
    #[serde(default = "default_health_grace_period")]
    pub grace_period_ms: u64,
}

impl HealthConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            warmup_ms: default_health_warmup(),
            interval_ms: default_health_interval(),
            timeout_ms: default_health_timeout(),
            grace_period_ms: default_health_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Maximum silence on an upstream connection before it is torn down
    #[serde(default = "default_upstream_idle_timeout")]
    pub upstream_idle_timeout_secs: u64,

    /// TCP connect timeout towards workers and the submission service
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Request bodies up to this size are buffered so a failed attempt can be retried
    #[serde(default = "default_max_replay_body_bytes")]
    pub max_replay_body_bytes: u64,

    /// Maximum idle upstream connections kept per worker
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

impl ProxyConfig {
    pub fn upstream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_idle_timeout_secs: default_upstream_idle_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_replay_body_bytes: default_max_replay_body_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubmissionConfig {
    /// Requests whose path starts with this prefix bypass the worker pool
    #[serde(default = "default_submission_prefix")]
    pub prefix: String,

    /// Host of the form submission service
    #[serde(default = "default_submission_host")]
    pub host: String,

    /// Port of the form submission service
    #[serde(default = "default_submission_port")]
    pub port: u16,
}

impl SubmissionConfig {
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid submission address {}:{}: {}", self.host, self.port, e))
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            prefix: default_submission_prefix(),
            host: default_submission_host(),
            port: default_submission_port(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_https_port() -> u16 {
    443
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_base_port() -> u16 {
    3000
}

fn default_min_uptime() -> u64 {
    1000 // exits within a second of spawning count as crashes
}

fn default_restart_backoff_base() -> u64 {
    250
}

fn default_restart_backoff_max() -> u64 {
    30_000
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_warmup() -> u64 {
    5000
}

fn default_health_interval() -> u64 {
    5000
}

fn default_health_timeout() -> u64 {
    2000
}

fn default_health_grace_period() -> u64 {
    10_000
}

fn default_upstream_idle_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_replay_body_bytes() -> u64 {
    1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_submission_prefix() -> String {
    "/submit".to_string()
}

fn default_submission_host() -> String {
    "127.0.0.1".to_string()
}

fn default_submission_port() -> u16 {
    4000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }

        if self.workers.command.trim().is_empty() {
            errors.push("workers: 'command' is required".to_string());
        }

        if self.workers.pool_size == Some(0) {
            errors.push("workers: 'pool_size' must be at least 1".to_string());
        }

        if self.workers.base_port == 0 {
            errors.push("workers: 'base_port' must be greater than 0".to_string());
        }

        let highest_port = self.workers.base_port as usize + self.workers.pool_size();
        if highest_port > u16::MAX as usize {
            errors.push(format!(
                "workers: base_port {} + pool_size {} exceeds the port range",
                self.workers.base_port,
                self.workers.pool_size()
            ));
        }

        if !self.health.path.starts_with('/') {
            errors.push("health: 'path' must start with '/'".to_string());
        }

        if self.health.interval_ms == 0 {
            errors.push("health: 'interval_ms' must be greater than 0".to_string());
        }

        if self.health.timeout_ms == 0 {
            errors.push("health: 'timeout_ms' must be greater than 0".to_string());
        }

        if self.proxy.upstream_idle_timeout_secs == 0 {
            errors.push("proxy: 'upstream_idle_timeout_secs' must be greater than 0".to_string());
        }

        if self.proxy.connect_timeout_ms == 0 {
            errors.push("proxy: 'connect_timeout_ms' must be greater than 0".to_string());
        }

        if !self.submission.prefix.starts_with('/') {
            errors.push("submission: 'prefix' must start with '/'".to_string());
        }

        if self.submission.port == 0 {
            errors.push("submission: 'port' must be greater than 0".to_string());
        }

        if let Err(e) = self.submission.addr() {
            errors.push(format!("submission: {}", e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
