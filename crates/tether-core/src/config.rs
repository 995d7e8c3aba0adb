//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::SALT_LEN;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub server: ServerConfig,
    pub timeouts: TimeoutConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP and channel listener binds to.
    pub listen: String,
    /// Site-wide pre-shared salt. At most 24 bytes.
    pub salt: String,
    /// Largest accepted HTTP fallback body.
    pub fallback_body_limit: usize,
    /// Undecryptable frames tolerated per connection before it is closed.
    pub decode_failure_budget: u32,
}

/// All values in seconds, except `event_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// One-shot correlation wait.
    pub event_ms: u64,
    /// Close a main-channel session after this long without traffic.
    pub idle_secs: u64,
    /// How often idle sessions are looked for.
    pub idle_check_secs: u64,
    /// Server ping period.
    pub ping_secs: u64,
    /// Unpaired bridges older than this are swept.
    pub bridge_idle_secs: u64,
    pub bridge_sweep_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset.
    pub level: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            salt: String::new(),
            fallback_body_limit: 512 * 1024,
            decode_failure_budget: 3,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            event_ms: 5_000,
            idle_secs: 90,
            idle_check_secs: 30,
            ping_secs: 30,
            bridge_idle_secs: 60,
            bridge_sweep_secs: 15,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TimeoutConfig {
    pub fn event(&self) -> Duration {
        Duration::from_millis(self.event_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn idle_check(&self) -> Duration {
        Duration::from_secs(self.idle_check_secs.max(1))
    }

    pub fn ping(&self) -> Duration {
        Duration::from_secs(self.ping_secs.max(1))
    }

    pub fn bridge_idle(&self) -> Duration {
        Duration::from_secs(self.bridge_idle_secs)
    }

    pub fn bridge_sweep(&self) -> Duration {
        Duration::from_secs(self.bridge_sweep_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("tether")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("server.salt is {0} bytes, at most 24 allowed")]
    InvalidSalt(usize),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.salt.len() > SALT_LEN {
            return Err(ConfigError::InvalidSalt(self.server.salt.len()));
        }
        Ok(())
    }

    /// Apply TETHER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TETHER_SERVER__LISTEN") {
            self.server.listen = v;
        }
        if let Ok(v) = std::env::var("TETHER_SERVER__SALT") {
            self.server.salt = v;
        }
        if let Ok(v) = std::env::var("TETHER_TIMEOUTS__IDLE_SECS") {
            if let Ok(n) = v.parse() {
                self.timeouts.idle_secs = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_LOG__LEVEL") {
            self.log.level = v;
        }
    }
}
