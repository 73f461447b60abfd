//! Configuration for the console session manager.
//!
//! Root configuration struct and nested section types with full defaults,
//! validation, YAML file loading, and environment variable overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "LABTERM_CONFIG";
pub const BASE_URL_ENV: &str = "LABTERM_BASE_URL";
pub const AUTH_TOKEN_ENV: &str = "LABTERM_AUTH_TOKEN";
pub const LOG_LEVEL_ENV: &str = "LABTERM_LOG_LEVEL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub backend: BackendConfig,
    pub polling: PollingConfig,
    pub buffer: BufferConfig,
    pub burst: BurstConfig,
    pub quality: QualityConfig,
    pub logging: LoggingConfig,
}

impl ConsoleConfig {
    /// Load from an explicit YAML file. Missing sections keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// Resolve, load, override from the environment, and validate.
    ///
    /// `explicit` wins over `$LABTERM_CONFIG`, which wins over the search
    /// path. No file at all yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| {
                std::env::var(CONFIG_PATH_ENV)
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from)
            })
            .or_else(find_config_file);

        let mut cfg = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from an environment lookup function.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(BASE_URL_ENV) {
            self.backend.base_url = url.trim().to_string();
        }
        if let Some(token) = lookup(AUTH_TOKEN_ENV) {
            self.backend.auth_token = Some(token.trim().to_string());
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            self.logging.level = level.trim().to_lowercase();
        }
    }

    /// Validates the entire configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        };

        // Backend
        if self.backend.base_url.trim().is_empty() {
            return invalid("backend.base_url is required");
        }
        if self.backend.request_timeout_ms == 0 {
            return invalid("backend.request_timeout_ms must be greater than zero");
        }

        // Polling
        let p = &self.polling;
        if p.base_interval_ms == 0 {
            return invalid("polling.base_interval_ms must be greater than zero");
        }
        if p.max_interval_ms < p.base_interval_ms {
            return invalid("polling.max_interval_ms must be at least polling.base_interval_ms");
        }
        if p.rate_limit_pause_threshold == 0 {
            return invalid("polling.rate_limit_pause_threshold must be at least 1");
        }
        if p.error_stop_threshold == 0 {
            return invalid("polling.error_stop_threshold must be at least 1");
        }

        // Buffer
        if self.buffer.capacity == 0 {
            return invalid("buffer.capacity must be at least 1");
        }

        // Burst
        if self.burst.min_attempts > self.burst.max_polls {
            return invalid("burst.min_attempts must not exceed burst.max_polls");
        }

        // Quality
        let q = &self.quality;
        if q.probe_interval_ms == 0 {
            return invalid("quality.probe_interval_ms must be greater than zero");
        }
        if q.excellent_below_ms == 0 || q.good_below_ms <= q.excellent_below_ms {
            return invalid("quality thresholds must satisfy 0 < excellent_below_ms < good_below_ms");
        }

        // Logging
        match self.logging.level.to_lowercase().trim() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return invalid("logging.level must be one of trace, debug, info, warn, error"),
        }
        match self.logging.format.to_lowercase().trim() {
            "console" | "json" => {}
            _ => return invalid("logging.format must be one of console, json"),
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Lab portal REST backend.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".into(),
            request_timeout_ms: 10_000,
            connect_timeout_ms: 2_000,
            auth_token: None,
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Adaptive poller pacing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub rate_limit_pause_threshold: u32,
    pub rate_limit_cooldown_ms: u64,
    pub error_stop_threshold: u32,
    pub initial_jitter_max_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 4_000,
            max_interval_ms: 30_000,
            rate_limit_pause_threshold: 3,
            rate_limit_cooldown_ms: 60_000,
            error_stop_threshold: 3,
            initial_jitter_max_ms: 2_000,
        }
    }
}

impl PollingConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    pub fn initial_jitter_max(&self) -> Duration {
        Duration::from_millis(self.initial_jitter_max_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: crate::log_buffer::DEFAULT_CAPACITY,
        }
    }
}

/// Post-command poll burst.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    pub max_polls: u32,
    pub min_attempts: u32,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            max_polls: 8,
            min_attempts: 2,
        }
    }
}

/// Link quality probing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub probe_interval_ms: u64,
    pub excellent_below_ms: u64,
    pub good_below_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            excellent_below_ms: 100,
            good_below_ms: 400,
        }
    }
}

impl QualityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "console".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// File discovery
// ---------------------------------------------------------------------------

/// Search for a configuration file in the standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    config_search_paths()
        .into_iter()
        .map(|dir| dir.join("config.yaml"))
        .find(|candidate| candidate.is_file())
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.trim().is_empty() {
            paths.push(Path::new(&xdg).join("labterm"));
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            paths.push(Path::new(&home).join(".config/labterm"));
        }
    }

    paths
}
