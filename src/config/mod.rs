//! Configuration management module
//!
//! Handles loading, validation, and management of service configuration,
//! plus the required-environment contract checked at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::feed::OptionType;

/// Errors raised by configuration and environment validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),
    #[error("CA certificate file not found: {0}")]
    CertNotFound(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,

    /// Snapshot polling interval in seconds
    pub snapshot_interval_secs: u64,

    /// Subscription refresh check interval in seconds
    pub contract_update_interval_secs: u64,

    /// Strike price step of the option chain
    pub strike_interval: u32,

    /// Number of strike steps tracked above and below the money
    pub window_size: u32,

    /// Option side to track
    pub option_type: OptionType,

    /// Symbol prefix used to build contract lookup keys
    pub symbol_prefix: String,

    /// Paper-trading endpoint flag, forwarded to the upstream feed
    pub simulation: bool,

    /// Logging level
    pub log_level: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Upstream feed configuration
    pub feed: FeedConfig,

    /// Downstream gateway configuration
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Quote stream WebSocket base URL
    pub ws_url: String,

    /// Session REST API base URL
    pub rest_url: String,

    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Hub URL; the GATEWAY_URL environment variable takes precedence
    pub url: String,

    /// Initial reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap in seconds
    pub reconnect_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Absolute or relative path to the rolling log file
    pub file_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            snapshot_interval_secs: 5,
            contract_update_interval_secs: 1,
            strike_interval: 100,
            window_size: 8,
            option_type: OptionType::Call,
            symbol_prefix: "TXO".to_string(),
            simulation: true,
            log_level: "info".to_string(),
            log: LogConfig::default(),
            feed: FeedConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://quote-bridge.local:9443".to_string(),
            rest_url: "https://quote-bridge.local".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3001".to_string(),
            reconnect_initial_ms: 1000,
            reconnect_max_secs: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_path: "logs/optrelay.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(interval) = env::var("OPTRELAY_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(value) = interval.parse::<u64>() {
                self.heartbeat_interval_secs = value;
            }
        }

        if let Ok(interval) = env::var("OPTRELAY_SNAPSHOT_INTERVAL_SECS") {
            if let Ok(value) = interval.parse::<u64>() {
                self.snapshot_interval_secs = value;
            }
        }

        if let Ok(interval) = env::var("OPTRELAY_CONTRACT_UPDATE_INTERVAL_SECS") {
            if let Ok(value) = interval.parse::<u64>() {
                self.contract_update_interval_secs = value;
            }
        }

        if let Ok(window) = env::var("OPTRELAY_WINDOW_SIZE") {
            if let Ok(value) = window.parse::<u32>() {
                self.window_size = value;
            }
        }

        if let Ok(simulation) = env::var("OPTRELAY_SIMULATION") {
            self.simulation = simulation.parse().unwrap_or(self.simulation);
        }

        if let Ok(log_level) = env::var("OPTRELAY_LOG_LEVEL") {
            self.log_level = log_level;
        }

        if let Ok(file_path) = env::var("OPTRELAY_LOG_FILE_PATH") {
            if !file_path.trim().is_empty() {
                self.log.file_path = file_path;
            }
        }

        if let Ok(ws_url) = env::var("OPTRELAY_FEED_WS_URL") {
            self.feed.ws_url = ws_url;
        }

        if let Ok(rest_url) = env::var("OPTRELAY_FEED_REST_URL") {
            self.feed.rest_url = rest_url;
        }

        if let Ok(timeout) = env::var("OPTRELAY_FEED_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.feed.timeout_seconds = value;
            }
        }

        // GATEWAY_URL is part of the required-environment contract, so the
        // bare name wins over the prefixed form.
        if let Ok(url) = env::var("GATEWAY_URL") {
            if !url.trim().is_empty() {
                self.gateway.url = url;
            }
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load_from_file(path).unwrap_or_else(|err| {
            tracing::warn!("Failed to load config: {}, using defaults", err);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("Heartbeat interval must be greater than 0");
        }

        if self.snapshot_interval_secs == 0 {
            anyhow::bail!("Snapshot interval must be greater than 0");
        }

        if self.contract_update_interval_secs == 0 {
            anyhow::bail!("Contract update interval must be greater than 0");
        }

        if self.strike_interval == 0 {
            anyhow::bail!("Strike interval must be greater than 0");
        }

        if self.symbol_prefix.trim().is_empty() {
            anyhow::bail!("Symbol prefix must not be empty");
        }

        if self.feed.timeout_seconds == 0 {
            anyhow::bail!("Feed timeout must be greater than 0");
        }

        if self.log.file_path.trim().is_empty() {
            anyhow::bail!("Log file path must not be empty");
        }

        Ok(())
    }
}

/// Upstream credentials and hub address supplied through the process
/// environment
///
/// Missing variables are a deployment error: the caller terminates with exit
/// code 1 so the container orchestrator restarts the service.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
    pub ca_cert_path: String,
    pub ca_password: String,
    pub gateway_url: String,
}

impl Credentials {
    /// Load the required environment contract
    ///
    /// Collects every missing variable before failing so the operator sees
    /// the full list in one pass. `SJ_KEY`/`SJ_SEC` accept the legacy
    /// `API_KEY`/`SECRET_KEY` names.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let mut require = |value: Option<String>, label: &str| match value {
            Some(value) if !value.trim().is_empty() => value,
            _ => {
                missing.push(label.to_string());
                String::new()
            }
        };

        let api_key = require(
            env::var("SJ_KEY").or_else(|_| env::var("API_KEY")).ok(),
            "SJ_KEY (upstream API key)",
        );
        let secret_key = require(
            env::var("SJ_SEC").or_else(|_| env::var("SECRET_KEY")).ok(),
            "SJ_SEC (upstream secret key)",
        );
        let ca_cert_path = require(
            env::var("CA_CERT_PATH").ok(),
            "CA_CERT_PATH (certificate path)",
        );
        let ca_password = require(
            env::var("CA_PASSWORD").ok(),
            "CA_PASSWORD (certificate passphrase)",
        );
        let gateway_url = require(env::var("GATEWAY_URL").ok(), "GATEWAY_URL (event hub URL)");

        if !missing.is_empty() {
            return Err(ConfigError::MissingEnv(missing));
        }

        if !Path::new(&ca_cert_path).exists() {
            return Err(ConfigError::CertNotFound(ca_cert_path));
        }

        Ok(Self {
            api_key,
            secret_key,
            ca_cert_path,
            ca_password,
            gateway_url,
        })
    }
}
