//! Pluggable key/value storage and the OAuth attempt store built on top of it.
//!
//! The attempt record is the only state that survives the round trip through the
//! EHR authorization server. It is written once by the authorization flow and
//! consumed once by the callback handler. Records are validated on read; a record
//! that fails to parse is reported as [`SmartError::CorruptFlowState`] instead of
//! being treated as absent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::SmartError;

/// Storage key for the in-flight authorization attempt
pub const OAUTH_ATTEMPT_KEY: &str = "smart-oauth-attempt";

/// Storage key for the persisted token record
pub const TOKEN_KEY: &str = "smart-token";

/// Attempts older than this are rejected by the callback handler
pub const DEFAULT_ATTEMPT_TTL_SECS: i64 = 300;

/// Key/value storage, shaped like browser `Storage`
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    fn get_item(&self, key: &str) -> Result<Option<String>, SmartError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), SmartError>;
    fn remove_item(&self, key: &str) -> Result<(), SmartError>;
    fn clear(&self) -> Result<(), SmartError>;
}

/// Process-local storage, lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, SmartError> {
        Ok(self.items().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), SmartError> {
        self.items().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), SmartError> {
        self.items().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), SmartError> {
        self.items().clear();
        Ok(())
    }
}

/// Durable storage backed by a single JSON object on disk
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>, SmartError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| SmartError::Storage(format!("Failed to read {:?}: {}", self.path, e)))?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| SmartError::Storage(format!("Malformed store {:?}: {}", self.path, e)))
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), SmartError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SmartError::Storage(format!("Failed to create {:?}: {}", parent, e)))?;
        }
        let json = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, json)
            .map_err(|e| SmartError::Storage(format!("Failed to write {:?}: {}", self.path, e)))?;
        debug!("Saved store to {:?}", self.path);
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, SmartError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_map()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), SmartError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove_item(&self, key: &str) -> Result<(), SmartError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), SmartError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .map_err(|e| SmartError::Storage(format!("Failed to remove {:?}: {}", self.path, e)))?;
        }
        Ok(())
    }
}

/// One in-flight authorization attempt
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthAttempt {
    pub state: String,
    pub code_verifier: String,
    pub issuer: String,
    pub launch_context: Option<String>,
    pub redirect_uri: String,
    pub token_endpoint: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for OAuthAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthAttempt")
            .field("issuer", &self.issuer)
            .field("redirect_uri", &self.redirect_uri)
            .field("token_endpoint", &self.token_endpoint)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl OAuthAttempt {
    /// Age of the attempt relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    fn validate(&self) -> Result<(), String> {
        if self.state.is_empty() {
            return Err("empty state".into());
        }
        if self.code_verifier.len() < 43 || self.code_verifier.len() > 128 {
            return Err("code verifier outside RFC 7636 length bounds".into());
        }
        for (name, value) in [
            ("issuer", &self.issuer),
            ("redirectUri", &self.redirect_uri),
            ("tokenEndpoint", &self.token_endpoint),
        ] {
            url::Url::parse(value).map_err(|e| format!("invalid {}: {}", name, e))?;
        }
        Ok(())
    }
}

/// Reads and writes the single authorization attempt
#[derive(Debug, Clone)]
pub struct OAuthStateStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl OAuthStateStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::seconds(DEFAULT_ATTEMPT_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace any prior attempt with `attempt`
    pub fn save(&self, attempt: &OAuthAttempt) -> Result<(), SmartError> {
        if self.store.get_item(OAUTH_ATTEMPT_KEY)?.is_some() {
            debug!("Clearing stale authorization attempt");
            self.store.remove_item(OAUTH_ATTEMPT_KEY)?;
        }
        let json = serde_json::to_string(attempt)?;
        self.store.set_item(OAUTH_ATTEMPT_KEY, &json)
    }

    /// Load the stored attempt without checking its age
    pub fn load(&self) -> Result<OAuthAttempt, SmartError> {
        let raw = self
            .store
            .get_item(OAUTH_ATTEMPT_KEY)?
            .ok_or(SmartError::MissingFlowState)?;
        let attempt: OAuthAttempt = serde_json::from_str(&raw).map_err(|e| {
            warn!("Failed to parse stored authorization attempt: {}", e);
            SmartError::CorruptFlowState(e.to_string())
        })?;
        attempt.validate().map_err(SmartError::CorruptFlowState)?;
        Ok(attempt)
    }

    /// Load the stored attempt, rejecting it once it is older than the TTL.
    /// Expired attempts are never extended.
    pub fn load_fresh(&self) -> Result<OAuthAttempt, SmartError> {
        let attempt = self.load()?;
        self.ensure_fresh(&attempt)?;
        Ok(attempt)
    }

    /// Reject `attempt` once it is older than the TTL
    pub fn ensure_fresh(&self, attempt: &OAuthAttempt) -> Result<(), SmartError> {
        let age = attempt.age(self.clock.now());
        if age > self.ttl {
            return Err(SmartError::ExpiredFlowState {
                age_secs: age.num_seconds(),
            });
        }
        Ok(())
    }

    pub fn delete(&self) -> Result<(), SmartError> {
        self.store.remove_item(OAUTH_ATTEMPT_KEY)
    }
}
