//! # Configuration
//!
//! Settings of the binary, loaded from an optional TOML file and then
//! overridden from the environment.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! rate_limit = 100
//! cors_origins = "http://localhost:3000"
//!
//! [submission]
//! timeout_ms = 30000
//!
//! [actions]
//! history_limit = 1024
//!
//! [logging]
//! format = "json"
//! ```
//!
//! ## Environment Overrides
//!
//! - `RETE_API_KEY`: enables Bearer authentication on every route but `/health`
//! - `RETE_RATE_LIMIT`: requests per second, 0 disables the limiter
//! - `RETE_CORS_ORIGINS`: comma-separated origins, or `*` for all
//! - `RETE_LOG_FORMAT`: `text` or `json`

use rete_core::{ReteError, SubmissionConfig, primitives::DEFAULT_HISTORY_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum accepted size of a configuration file (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// SECTIONS
// =============================================================================

/// `[server]`: monitoring HTTP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Requests per second; 0 disables rate limiting.
    pub rate_limit: u32,
    /// Comma-separated allowed origins, `*` for any. Localhost only when unset.
    pub cors_origins: Option<String>,
    /// Bearer key. Only ever read from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            rate_limit: 100,
            cors_origins: None,
            api_key: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `[actions]`: action executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Execution records retained for `/firings`.
    pub history_limit: usize,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `[logging]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

// =============================================================================
// CONFIG
// =============================================================================

/// Complete configuration of the binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub submission: SubmissionConfig,
    pub actions: ActionsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ReteError> {
        toml::from_str(text).map_err(|e| ReteError::SerializationError(format!("Config: {}", e)))
    }

    /// Read `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ReteError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ReteError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            ReteError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ReteError::SerializationError(format!(
                "Config file size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReteError::IoError(format!("Read config: {}", e)))?;
        Self::from_toml_str(&text)
    }

    /// Apply `RETE_*` overrides obtained through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("RETE_API_KEY").filter(|k| !k.is_empty()) {
            self.server.api_key = Some(key);
        }
        if let Some(raw) = lookup("RETE_RATE_LIMIT") {
            match raw.trim().parse() {
                Ok(rps) => self.server.rate_limit = rps,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid RETE_RATE_LIMIT"),
            }
        }
        if let Some(origins) = lookup("RETE_CORS_ORIGINS").filter(|o| !o.trim().is_empty()) {
            self.server.cors_origins = Some(origins);
        }
        if let Some(raw) = lookup("RETE_LOG_FORMAT") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "text" => self.logging.format = LogFormat::Text,
                _ => tracing::warn!(value = %raw, "ignoring invalid RETE_LOG_FORMAT"),
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
