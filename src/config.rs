use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Configuration problems detected before the dev server is launched
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("dev_server.source_path cannot be empty")]
    EmptySourcePath,
    #[error("dev_server.script_name cannot be empty")]
    EmptyScriptName,
    #[error("dev_server.build_signal_pattern is not a valid regular expression: {0}")]
    InvalidPattern(String),
    #[error("dev_server.package_manager is invalid: {0}")]
    InvalidPackageManager(String),
}

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Proxy listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// The front-end dev server to launch and proxy to
    pub dev_server: DevServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port the proxy listens on (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1, this is a development tool)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections kept to the dev server (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for the dev server to answer a forwarded request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Configuration for the supervised dev server
///
/// # Security Warning
///
/// `package_manager` and `script_name` are executed as a command in
/// `source_path`. Only load configuration files you trust.
#[derive(Debug, Deserialize, Clone)]
pub struct DevServerConfig {
    /// Directory containing the front-end project (its package.json)
    pub source_path: String,

    /// Name of the package.json script that starts the dev server
    pub script_name: String,

    /// Package manager used to run the script (default: npm)
    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    /// How long each request waits for the dev server to become ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Regex matched against stdout to detect a successful build
    #[serde(default = "default_build_signal_pattern")]
    pub build_signal_pattern: String,

    /// How long to wait for the build success line before giving up
    #[serde(default = "default_build_signal_timeout")]
    pub build_signal_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL on shutdown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Extra environment variables for the dev server
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Readiness probe backoff
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl DevServerConfig {
    /// Minimal config for `script_name` in `source_path`, everything else defaulted
    pub fn new(source_path: &str, script_name: &str) -> Self {
        Self {
            source_path: source_path.to_string(),
            script_name: script_name.to_string(),
            package_manager: default_package_manager(),
            startup_timeout_secs: default_startup_timeout(),
            build_signal_pattern: default_build_signal_pattern(),
            build_signal_timeout_secs: default_build_signal_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            env: HashMap::new(),
            probe: ProbeConfig::default(),
        }
    }

    /// Set the package manager (builder pattern)
    pub fn with_package_manager(mut self, package_manager: &str) -> Self {
        self.package_manager = package_manager.to_string();
        self
    }

    /// Set the probe backoff (builder pattern)
    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn build_signal_timeout(&self) -> Duration {
        Duration::from_secs(self.build_signal_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn build_signal_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.build_signal_pattern).map_err(|e| ConfigError::InvalidPattern(e.to_string()))
    }

    /// Check the required fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_path.trim().is_empty() {
            return Err(ConfigError::EmptySourcePath);
        }
        if self.script_name.trim().is_empty() {
            return Err(ConfigError::EmptyScriptName);
        }
        self.build_signal_regex()?;
        Ok(())
    }
}

/// Backoff for the HTTP readiness probe, all values in milliseconds
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Per-attempt timeout for the first probe
    #[serde(default = "default_probe_initial_timeout")]
    pub initial_timeout_ms: u64,

    /// Pause between failed attempts
    #[serde(default = "default_probe_retry_delay")]
    pub retry_delay_ms: u64,

    /// Added to the per-attempt timeout after every failure
    #[serde(default = "default_probe_timeout_increment")]
    pub timeout_increment_ms: u64,

    /// Upper bound for the per-attempt timeout
    #[serde(default = "default_probe_max_timeout")]
    pub max_timeout_ms: u64,
}

impl ProbeConfig {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout_increment(&self) -> Duration {
        Duration::from_millis(self.timeout_increment_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: default_probe_initial_timeout(),
            retry_delay_ms: default_probe_retry_delay(),
            timeout_increment_ms: default_probe_timeout_increment(),
            max_timeout_ms: default_probe_max_timeout(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    300 // first compile of a lazily built route can be slow
}

fn default_package_manager() -> String {
    "npm".to_string()
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_build_signal_pattern() -> String {
    "Compiled.*successfully".to_string()
}

fn default_build_signal_timeout() -> u64 {
    300
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_probe_initial_timeout() -> u64 {
    1000
}

fn default_probe_retry_delay() -> u64 {
    500
}

fn default_probe_timeout_increment() -> u64 {
    3000
}

fn default_probe_max_timeout() -> u64 {
    10000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Err(e) = self.dev_server.validate() {
            anyhow::bail!("Configuration error: {}", e);
        }
        Ok(())
    }
}
