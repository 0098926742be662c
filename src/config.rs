//! Konfiguration
//!
//! Reihenfolge: eingebaute Defaults → optionale TOML-Datei → Umgebungsvariablen.
//! Die Datei liegt standardmäßig im Config-Verzeichnis der Plattform
//! (`directories`), `CALLSYNC_CONFIG` überschreibt den Pfad.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const ENV_CONFIG_PATH: &str = "CALLSYNC_CONFIG";
pub const ENV_API_URL: &str = "CALLSYNC_API_URL";
pub const ENV_SIGNALING_URL: &str = "CALLSYNC_SIGNALING_URL";
pub const ENV_AUTH_TOKEN: &str = "CALLSYNC_AUTH_TOKEN";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// CONFIG SECTIONS
// ============================================================================

/// REST Control-Plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub api_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000/api".to_string(),
            request_timeout_secs: 15,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Persistente Signaling-Verbindung
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub reconnect: bool,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub ping_interval_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/signaling".to_string(),
            reconnect: true,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            // Proxies kappen idle WebSockets gern nach 30s
            ping_interval_secs: 25,
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Verhalten der Call-Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub no_answer_timeout_secs: u64,
    pub clear_delay_secs: u64,
    /// Zweiter eingehender Anruf während einer aktiven Session wird abgewiesen
    pub auto_reject_second_call: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            no_answer_timeout_secs: 30,
            clear_delay_secs: 2,
            auto_reject_second_call: true,
        }
    }
}

impl CallConfig {
    pub fn no_answer_timeout(&self) -> Duration {
        Duration::from_secs(self.no_answer_timeout_secs)
    }

    pub fn clear_delay(&self) -> Duration {
        Duration::from_secs(self.clear_delay_secs)
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Wird nur weitergereicht, nie selbst ausgestellt
    pub auth_token: Option<String>,
    pub server: ServerConfig,
    pub signaling: SignalingConfig,
    pub call: CallConfig,
}

impl AppConfig {
    /// Lädt Datei (falls vorhanden) und Umgebungsvariablen
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                tracing::debug!("No config file at {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("Loading config from {:?}", path);
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Ermittelt den Pfad zur Config-Datei
    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            return Some(PathBuf::from(path));
        }
        let dirs = directories::ProjectDirs::from("com", "callsync", "callsync")?;
        Some(dirs.config_dir().join("config.toml"))
    }

    /// Überschreibt Werte aus der Umgebung (`lookup` ist in Tests austauschbar)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.server.api_url = url;
        }
        if let Some(url) = lookup(ENV_SIGNALING_URL) {
            self.signaling.url = url;
        }
        if let Some(token) = lookup(ENV_AUTH_TOKEN) {
            self.auth_token = Some(token).filter(|t| !t.is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.server.api_url)
            .map_err(|e| ConfigError::Invalid(format!("server.api_url: {}", e)))?;
        Url::parse(&self.signaling.url)
            .map_err(|e| ConfigError::Invalid(format!("signaling.url: {}", e)))?;

        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.signaling.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "signaling.ping_interval_secs must be positive".to_string(),
            ));
        }
        if self.signaling.reconnect_initial_ms == 0
            || self.signaling.reconnect_max_ms < self.signaling.reconnect_initial_ms
        {
            return Err(ConfigError::Invalid(
                "signaling reconnect backoff must be positive and max >= initial".to_string(),
            ));
        }
        if self.call.no_answer_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "call.no_answer_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.call.no_answer_timeout(), Duration::from_secs(30));
        assert_eq!(config.call.clear_delay(), Duration::from_secs(2));
        assert!(config.call.auto_reject_second_call);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            auth_token = "t-1"

            [signaling]
            url = "wss://signal.example.com"
            reconnect = false

            [call]
            no_answer_timeout_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.auth_token.as_deref(), Some("t-1"));
        assert_eq!(config.signaling.url, "wss://signal.example.com");
        assert!(!config.signaling.reconnect);
        assert_eq!(config.signaling.ping_interval_secs, 25);
        assert_eq!(config.call.no_answer_timeout_secs, 45);
        assert_eq!(config.call.clear_delay_secs, 2);
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_API_URL, "https://api.example.com"),
            (ENV_AUTH_TOKEN, "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.api_url, "https://api.example.com");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.signaling.url, SignalingConfig::default().url);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.api_url = "no scheme".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.signaling.reconnect_max_ms = 10;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.call.no_answer_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_broken_toml_is_parse_error() {
        assert!(matches!(
            AppConfig::from_toml_str("call = [1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }
}
