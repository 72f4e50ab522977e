use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::fhir::DEFAULT_READ_MAX_ATTEMPTS;
use crate::storage::DEFAULT_ATTEMPT_TTL_SECS;
use crate::token::{DEFAULT_REFRESH_BUFFER_SECS, DEFAULT_REFRESH_COOLDOWN_SECS};
use crate::write::audit::DEFAULT_AUDIT_CAPACITY;
use crate::write::retry::{DEFAULT_WRITE_INITIAL_DELAY, DEFAULT_WRITE_MAX_RETRIES};
use crate::write::RetryPolicy;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SmartConfig {
    pub schema_version: u32,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Refuse launches from issuers that are not Epic, Cerner or Athena
    pub require_known_vendor: bool,
    pub listen_addr: String,
    pub refresh_buffer_secs: u64,
    pub refresh_cooldown_secs: u64,
    pub attempt_ttl_secs: i64,
    pub request_timeout_secs: u64,
    pub read_max_attempts: u32,
    pub write_max_retries: u32,
    pub write_initial_delay_ms: u64,
    /// Durable token/attempt storage; `None` keeps them in memory only
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub audit_capacity: usize,
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            client_id: String::new(),
            redirect_uri: "http://127.0.0.1:8765/callback".to_string(),
            scopes: [
                "launch",
                "openid",
                "fhirUser",
                "offline_access",
                "patient/Patient.read",
                "patient/Observation.read",
                "patient/MedicationRequest.read",
                "patient/Condition.read",
                "patient/AllergyIntolerance.read",
                "patient/Immunization.read",
                "patient/DocumentReference.write",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            require_known_vendor: false,
            listen_addr: "127.0.0.1:8765".to_string(),
            refresh_buffer_secs: DEFAULT_REFRESH_BUFFER_SECS,
            refresh_cooldown_secs: DEFAULT_REFRESH_COOLDOWN_SECS,
            attempt_ttl_secs: DEFAULT_ATTEMPT_TTL_SECS,
            request_timeout_secs: 30,
            read_max_attempts: DEFAULT_READ_MAX_ATTEMPTS,
            write_max_retries: DEFAULT_WRITE_MAX_RETRIES,
            write_initial_delay_ms: DEFAULT_WRITE_INITIAL_DELAY.as_millis() as u64,
            state_dir: None,
            log_dir: None,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl SmartConfig {
    /// Get the default config directory
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".smart-launch"))
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file or return default
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                debug!("Failed to load config, using default: {}", e);
                Self::default()
            }
        }
    }

    /// Load config from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            bail!("client_id is required");
        }
        let redirect = url::Url::parse(&self.redirect_uri)
            .with_context(|| format!("redirect_uri is not a URL: {}", self.redirect_uri))?;
        if !matches!(redirect.scheme(), "http" | "https") {
            bail!("redirect_uri must use http or https");
        }
        if self.scopes.iter().all(|s| s.trim().is_empty()) {
            bail!("at least one scope is required");
        }
        if self.read_max_attempts == 0 {
            bail!("read_max_attempts must be at least 1");
        }
        if self.attempt_ttl_secs <= 0 {
            bail!("attempt_ttl_secs must be positive");
        }
        Ok(())
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::config_dir()?.join("logs")),
        }
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.refresh_cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn write_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.write_max_retries,
            initial_delay: Duration::from_millis(self.write_initial_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SmartConfig {
        SmartConfig {
            client_id: "client-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_values() {
        let config = SmartConfig::default();
        assert_eq!(config.refresh_buffer_secs, 30);
        assert_eq!(config.refresh_cooldown_secs, 5);
        assert_eq!(config.attempt_ttl_secs, 300);
        assert_eq!(config.read_max_attempts, 3);
        assert_eq!(config.write_retry_policy(), RetryPolicy::default());
        assert_eq!(config.audit_capacity, 100);
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(SmartConfig::default().validate().is_err());

        let mut bad_redirect = valid();
        bad_redirect.redirect_uri = "smart://callback".into();
        assert!(bad_redirect.validate().is_err());

        let mut no_scopes = valid();
        no_scopes.scopes.clear();
        assert!(no_scopes.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"client_id": "abc", "listen_addr": "127.0.0.1:9000"}"#).unwrap();

        let config = SmartConfig::load_from(&path).unwrap();
        assert_eq!(config.client_id, "abc");
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.refresh_cooldown_secs, 5);
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = valid();
        config.save_to(&path).unwrap();
        assert_eq!(SmartConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SmartConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SmartConfig::default());
    }
}
