//! Configuration management for WAHA
//!
//! Handles loading, validating and saving the TOML configuration: logging,
//! authentication limits, health policy and the sessions to start on boot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::health::HealthPolicy;
use crate::session::{AuthPolicy, SessionConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General application settings
    #[serde(default)]
    pub general: GeneralConfig,
    /// Challenge limits and QR cadence
    #[serde(default)]
    pub auth: AuthConfig,
    /// Health report settings
    #[serde(default)]
    pub health: HealthConfig,
    /// Sessions known at boot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionEntry>,
}

impl Config {
    /// Reject limits that would make authentication impossible
    pub fn validate(&self) -> Result<()> {
        let auth = &self.auth;
        for (key, value) in [
            ("auth.otp_max_attempts", u64::from(auth.otp_max_attempts)),
            ("auth.captcha_max_attempts", u64::from(auth.captcha_max_attempts)),
            ("auth.otp_timeout_secs", auth.otp_timeout_secs),
            ("auth.captcha_timeout_secs", auth.captcha_timeout_secs),
            ("auth.qr_ttl_secs", auth.qr_ttl_secs),
            ("auth.qr_refresh_interval_secs", auth.qr_refresh_interval_secs),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", key)));
            }
        }
        if self.health.stale_after_secs == Some(0) {
            return Err(Error::Config("health.stale_after_secs must be greater than zero".to_string()));
        }

        let mut seen = HashSet::new();
        for entry in &self.sessions {
            let name = entry.name.trim();
            if name.is_empty() {
                return Err(Error::Config("session name must not be empty".to_string()));
            }
            if !seen.insert(name) {
                return Err(Error::Config(format!("session '{}' is configured twice", name)));
            }
        }
        Ok(())
    }

    /// Session config for a configured entry, with the global auth policy applied
    pub fn session_config(&self, entry: &SessionEntry) -> SessionConfig {
        SessionConfig {
            auth: self.auth.policy(),
            metadata: entry.metadata.clone(),
        }
    }

    /// Entries marked for start on boot
    pub fn autostart_sessions(&self) -> impl Iterator<Item = &SessionEntry> {
        self.sessions.iter().filter(|s| s.autostart)
    }
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log filter used when no verbosity flag is given
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Authentication challenge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub otp_max_attempts: u32,
    pub captcha_max_attempts: u32,
    pub otp_timeout_secs: u64,
    pub captcha_timeout_secs: u64,
    pub qr_ttl_secs: u64,
    pub qr_refresh_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let policy = AuthPolicy::default();
        Self {
            otp_max_attempts: policy.otp_max_attempts,
            captcha_max_attempts: policy.captcha_max_attempts,
            otp_timeout_secs: policy.otp_timeout.as_secs(),
            captcha_timeout_secs: policy.captcha_timeout.as_secs(),
            qr_ttl_secs: policy.qr_ttl.as_secs(),
            qr_refresh_interval_secs: policy.qr_refresh_interval.as_secs(),
        }
    }
}

impl AuthConfig {
    /// Runtime policy handed to each session
    pub fn policy(&self) -> AuthPolicy {
        AuthPolicy {
            otp_max_attempts: self.otp_max_attempts,
            captcha_max_attempts: self.captcha_max_attempts,
            otp_timeout: Duration::from_secs(self.otp_timeout_secs),
            captcha_timeout: Duration::from_secs(self.captcha_timeout_secs),
            qr_ttl: Duration::from_secs(self.qr_ttl_secs),
            qr_refresh_interval: Duration::from_secs(self.qr_refresh_interval_secs),
        }
    }
}

/// Health report settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub policy: HealthPolicy,
    /// WORKING sessions whose engine was last seen longer ago than this fail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_after_secs: Option<u64>,
}

impl HealthConfig {
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }
}

/// A session known at boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path; a missing file means defaults
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };
        config.validate()?;

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("waha").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        self.config.validate()?;

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Add or replace a configured session
    pub fn upsert_session(&mut self, entry: SessionEntry) {
        match self.config.sessions.iter_mut().find(|s| s.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.config.sessions.push(entry),
        }
    }

    /// Remove a configured session; returns whether it existed
    pub fn remove_session(&mut self, name: &str) -> bool {
        let before = self.config.sessions.len();
        self.config.sessions.retain(|s| s.name != name);
        self.config.sessions.len() != before
    }
}
