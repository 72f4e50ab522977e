//! Token lifecycle manager
//!
//! Single owner of the live token. Expiry is always `issued_at + expires_in`,
//! recomputed whenever a token is stored. Refresh is single-flight: the first
//! caller spawns the refresh request and every concurrent caller awaits the same
//! shared future, so the token endpoint never sees two `refresh_token` grants
//! at once. A completed refresh opens a cooldown window in which further
//! refresh attempts fail fast with [`SmartError::RefreshTooSoon`].

use chrono::{DateTime, Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::SmartError;
use crate::logging;
use crate::storage::{KeyValueStore, TOKEN_KEY};

pub const DEFAULT_REFRESH_BUFFER_SECS: u64 = 30;
pub const DEFAULT_REFRESH_COOLDOWN_SECS: u64 = 5;

/// Token endpoint response (RFC 6749 §5.1 plus SMART launch context)
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub patient: Option<String>,
    #[serde(default)]
    pub encounter: Option<String>,
    #[serde(default, rename = "fhirUser")]
    pub fhir_user: Option<String>,
    #[serde(default)]
    pub smart_style_url: Option<String>,
    #[serde(default)]
    pub need_patient_banner: Option<bool>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Error body of a failed token request
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// The session token with its computed expiry
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub patient: Option<String>,
    pub encounter: Option<String>,
    pub fhir_user: Option<String>,
    pub smart_style_url: Option<String>,
    pub need_patient_banner: Option<bool>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Token {
    pub fn from_response(response: TokenResponse, issued_at: DateTime<Utc>) -> Self {
        let mut token = Self {
            access_token: response.access_token,
            token_type: response.token_type,
            expires_in: response.expires_in,
            scope: response.scope,
            refresh_token: response.refresh_token,
            id_token: response.id_token,
            patient: response.patient,
            encounter: response.encounter,
            fhir_user: response.fhir_user,
            smart_style_url: response.smart_style_url,
            need_patient_banner: response.need_patient_banner,
            issued_at,
            expires_at: None,
        };
        token.recompute_expiry();
        token
    }

    fn recompute_expiry(&mut self) {
        self.expires_at = self.expires_in.map(|secs| self.issued_at + Duration::seconds(secs));
    }

    /// Fold a refresh response into this token. Fields the response omits,
    /// `refresh_token` in particular, keep their previous values.
    fn merge(&self, response: TokenResponse, issued_at: DateTime<Utc>) -> Self {
        let mut merged = Self {
            access_token: response.access_token,
            token_type: response.token_type,
            expires_in: response.expires_in.or(self.expires_in),
            scope: response.scope.or_else(|| self.scope.clone()),
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
            id_token: response.id_token.or_else(|| self.id_token.clone()),
            patient: response.patient.or_else(|| self.patient.clone()),
            encounter: response.encounter.or_else(|| self.encounter.clone()),
            fhir_user: response.fhir_user.or_else(|| self.fhir_user.clone()),
            smart_style_url: response.smart_style_url.or_else(|| self.smart_style_url.clone()),
            need_patient_banner: response.need_patient_banner.or(self.need_patient_banner),
            issued_at,
            expires_at: None,
        };
        merged.recompute_expiry();
        merged
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Expiry summary for display
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryInfo {
    pub is_expired: bool,
    pub time_remaining: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub can_refresh: bool,
}

/// "1h 5m", "4m 10s", "12s" or "Expired"
pub fn format_time_remaining(remaining: Duration) -> String {
    let secs = remaining.num_seconds();
    if secs <= 0 {
        return "Expired".to_string();
    }
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Persisted form: the token plus the endpoint it refreshes against
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRecord {
    token: Token,
    token_endpoint: String,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Token, String>>>;

#[derive(Default)]
struct State {
    token: Option<Token>,
    token_endpoint: Option<String>,
    in_flight: Option<SharedRefresh>,
    last_refresh: Option<DateTime<Utc>>,
    /// Bumped whenever the session is replaced or cleared
    generation: u64,
}

impl State {
    /// Start a new session generation; refreshes spawned earlier no longer apply
    fn replace_session(&mut self, token: Option<Token>, token_endpoint: Option<String>) {
        self.token = token;
        self.token_endpoint = token_endpoint;
        self.last_refresh = None;
        self.in_flight = None;
        self.generation = self.generation.wrapping_add(1);
    }
}

struct Inner {
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    client_id: String,
    cooldown: Duration,
    store: Option<Arc<dyn KeyValueStore>>,
    state: Mutex<State>,
}

/// Owner of the live token; cheap to clone, clones share state
#[derive(Clone)]
pub struct TokenLifecycleManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TokenLifecycleManager")
            .field("client_id", &self.inner.client_id)
            .field("token", &state.token)
            .field("refresh_in_flight", &state.in_flight.is_some())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, token: &Token, token_endpoint: Option<&str>) {
        let (Some(store), Some(endpoint)) = (&self.store, token_endpoint) else {
            return;
        };
        let record = TokenRecord {
            token: token.clone(),
            token_endpoint: endpoint.to_string(),
        };
        let result = serde_json::to_string(&record)
            .map_err(SmartError::from)
            .and_then(|json| store.set_item(TOKEN_KEY, &json));
        if let Err(e) = result {
            warn!("Failed to persist token: {}", e);
        }
    }

    async fn run_refresh(
        self: Arc<Self>,
        generation: u64,
        endpoint: String,
        refresh_token: String,
    ) -> Result<Token, String> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        let outcome = request_token(&self.http, &endpoint, &form).await;
        let now = self.clock.now();

        let mut state = self.lock();
        if state.generation != generation {
            drop(state);
            debug!("Session changed during refresh, discarding result");
            return Err("session changed".into());
        }
        state.in_flight = None;
        match outcome {
            Ok(response) => {
                let rotated = response.refresh_token.is_some();
                let expires_in = response.expires_in;
                let Some(current) = &state.token else {
                    return Err("session changed".into());
                };
                let token = current.merge(response, now);
                state.token = Some(token.clone());
                state.last_refresh = Some(now);
                let endpoint = state.token_endpoint.clone();
                drop(state);

                self.persist(&token, endpoint.as_deref());
                logging::log_token_refreshed(expires_in, rotated);
                Ok(token)
            }
            Err(e) => {
                drop(state);
                logging::log_token_refresh_failed(&e);
                Err(e)
            }
        }
    }
}

impl TokenLifecycleManager {
    pub fn new(http: reqwest::Client, clock: Arc<dyn Clock>, client_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                clock,
                client_id: client_id.into(),
                cooldown: Duration::seconds(DEFAULT_REFRESH_COOLDOWN_SECS as i64),
                store: None,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Builder-style options; only valid before the manager is shared
    pub fn with_options(
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        client_id: impl Into<String>,
        cooldown: std::time::Duration,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                clock,
                client_id: client_id.into(),
                cooldown: Duration::from_std(cooldown)
                    .unwrap_or_else(|_| Duration::seconds(DEFAULT_REFRESH_COOLDOWN_SECS as i64)),
                store,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn current(&self) -> Option<Token> {
        self.inner.lock().token.clone()
    }

    pub fn token_endpoint(&self) -> Option<String> {
        self.inner.lock().token_endpoint.clone()
    }

    /// Store a freshly issued token bound to `token_endpoint`. Expiry is
    /// recomputed and any previous cooldown is reset.
    pub fn set_token(&self, mut token: Token, token_endpoint: &str) {
        token.recompute_expiry();
        self.inner
            .lock()
            .replace_session(Some(token.clone()), Some(token_endpoint.to_string()));
        self.inner.persist(&token, Some(token_endpoint));
    }

    /// True when there is no token, or `now >= expires_at - buffer`.
    /// A token without an expiry is treated as expiring.
    pub fn is_expiring_within(&self, buffer: std::time::Duration) -> bool {
        let buffer = Duration::from_std(buffer).unwrap_or_else(|_| Duration::zero());
        let now = self.inner.clock.now();
        match self.inner.lock().token.as_ref().and_then(|t| t.expires_at) {
            Some(expires_at) => now >= expires_at - buffer,
            None => true,
        }
    }

    pub fn expiry_info(&self) -> Option<ExpiryInfo> {
        let token = self.current()?;
        let now = self.inner.clock.now();
        let (is_expired, time_remaining) = match token.expires_at {
            Some(at) => (now >= at, format_time_remaining(at - now)),
            None => (false, "Unknown".to_string()),
        };
        Some(ExpiryInfo {
            is_expired,
            time_remaining,
            expires_at: token.expires_at,
            can_refresh: token.refresh_token.is_some(),
        })
    }

    /// Refresh the access token, joining a refresh already in flight.
    ///
    /// Fails fast, without a network call, when no refresh token is held or when
    /// the last refresh completed inside the cooldown window. A failed refresh
    /// leaves the current token in place.
    pub async fn refresh(&self) -> Result<Token, SmartError> {
        let refresh = {
            let mut state = self.inner.lock();
            match &state.in_flight {
                Some(in_flight) => {
                    debug!("Joining in-flight token refresh");
                    in_flight.clone()
                }
                None => {
                    let now = self.inner.clock.now();
                    if let Some(last) = state.last_refresh {
                        if now - last < self.inner.cooldown {
                            return Err(SmartError::RefreshTooSoon);
                        }
                    }
                    let token = state.token.as_ref().ok_or(SmartError::NotAuthenticated)?;
                    let refresh_token = token
                        .refresh_token
                        .clone()
                        .ok_or(SmartError::NoRefreshToken)?;
                    let endpoint = state
                        .token_endpoint
                        .clone()
                        .ok_or(SmartError::NotAuthenticated)?;

                    // Spawned so the request completes even if this caller goes away
                    let handle = tokio::spawn(self.inner.clone().run_refresh(
                        state.generation,
                        endpoint,
                        refresh_token,
                    ));
                    let shared = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(format!("refresh task ended unexpectedly: {}", e)),
                        }
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some(shared.clone());
                    shared
                }
            }
        };

        refresh.await.map_err(SmartError::RefreshFailed)
    }

    /// Access token usable for a request, refreshing first when it expires
    /// within `buffer`. A failed refresh surfaces as `TokenRefreshFailed`;
    /// the stale token is never handed out.
    pub async fn access_token(&self, buffer: std::time::Duration) -> Result<String, SmartError> {
        if self.current().is_none() {
            return Err(SmartError::NotAuthenticated);
        }
        if !self.is_expiring_within(buffer) {
            return self.current().map(|t| t.access_token).ok_or(SmartError::NotAuthenticated);
        }

        match self.refresh().await {
            Ok(token) => Ok(token.access_token),
            // Someone else refreshed moments ago; use their token while it is still valid
            Err(SmartError::RefreshTooSoon) => {
                let now = self.inner.clock.now();
                match self.current() {
                    Some(token) if !token.is_expired_at(now) => Ok(token.access_token),
                    _ => Err(SmartError::TokenRefreshFailed(
                        SmartError::RefreshTooSoon.to_string(),
                    )),
                }
            }
            // Without a lifetime and without a refresh token there is nothing better to use
            Err(SmartError::NoRefreshToken) => match self.current() {
                Some(token) if token.expires_at.is_none() => Ok(token.access_token),
                _ => Err(SmartError::TokenRefreshFailed(
                    SmartError::NoRefreshToken.to_string(),
                )),
            },
            Err(e) => Err(SmartError::TokenRefreshFailed(e.to_string())),
        }
    }

    /// Load a persisted token, if any. A record that fails to parse is
    /// reported as `CorruptToken` and left in place for inspection.
    pub fn restore(&self) -> Result<Option<Token>, SmartError> {
        let Some(store) = &self.inner.store else {
            return Ok(None);
        };
        let Some(raw) = store.get_item(TOKEN_KEY)? else {
            return Ok(None);
        };
        let record: TokenRecord =
            serde_json::from_str(&raw).map_err(|e| SmartError::CorruptToken(e.to_string()))?;
        if record.token.access_token.is_empty() {
            return Err(SmartError::CorruptToken("empty access token".into()));
        }
        if let Err(e) = url::Url::parse(&record.token_endpoint) {
            return Err(SmartError::CorruptToken(format!("invalid token endpoint: {}", e)));
        }

        let mut token = record.token;
        token.recompute_expiry();
        self.inner
            .lock()
            .replace_session(Some(token.clone()), Some(record.token_endpoint));
        logging::log_session_restored(token.is_expired_at(self.inner.clock.now()));
        Ok(Some(token))
    }

    /// Drop the token and its persisted record
    pub fn clear(&self) -> Result<(), SmartError> {
        self.inner.lock().replace_session(None, None);
        if let Some(store) = &self.inner.store {
            store.remove_item(TOKEN_KEY)?;
        }
        logging::log_session_cleared();
        Ok(())
    }
}

/// POST a form to the token endpoint. Errors carry the OAuth `error` and
/// `error_description` when the server sent them, otherwise the HTTP status.
pub(crate) async fn request_token(
    http: &reqwest::Client,
    endpoint: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, String> {
    let response = http
        .post(endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| format!("token endpoint unreachable: {}", e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("failed to read token response: {}", e))?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<OAuthErrorBody>(&body) {
            Ok(err) => match err.error_description {
                Some(description) => format!("{}: {}", err.error, description),
                None => err.error,
            },
            Err(_) => format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_string(),
        });
    }

    let token: TokenResponse =
        serde_json::from_str(&body).map_err(|e| format!("malformed token response: {}", e))?;
    if token.access_token.is_empty() {
        return Err("token response has an empty access_token".into());
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn response(access: &str, refresh: Option<&str>, expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: access.into(),
            token_type: "Bearer".into(),
            expires_in: Some(expires_in),
            scope: Some("launch patient/*.read".into()),
            refresh_token: refresh.map(|s| s.to_string()),
            id_token: None,
            patient: Some("p1".into()),
            encounter: None,
            fhir_user: None,
            smart_style_url: None,
            need_patient_banner: None,
        }
    }

    fn manager(clock: Arc<ManualClock>) -> TokenLifecycleManager {
        TokenLifecycleManager::new(reqwest::Client::new(), clock, "client-1")
    }

    #[test]
    fn test_expiry_computed_from_issue_time() {
        let issued = Utc::now();
        let token = Token::from_response(response("a", None, 3600), issued);
        assert_eq!(token.expires_at, Some(issued + Duration::seconds(3600)));
    }

    #[test]
    fn test_is_expiring_within() {
        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        assert!(tokens.is_expiring_within(std::time::Duration::from_secs(30)));

        tokens.set_token(
            Token::from_response(response("a", Some("r"), 60), clock.now()),
            "https://auth.example.org/token",
        );
        assert!(!tokens.is_expiring_within(std::time::Duration::from_secs(30)));

        clock.advance(Duration::seconds(30));
        assert!(tokens.is_expiring_within(std::time::Duration::from_secs(30)));
    }

    #[test]
    fn test_expiry_info_formatting() {
        assert_eq!(format_time_remaining(Duration::seconds(3900)), "1h 5m");
        assert_eq!(format_time_remaining(Duration::seconds(250)), "4m 10s");
        assert_eq!(format_time_remaining(Duration::seconds(12)), "12s");
        assert_eq!(format_time_remaining(Duration::seconds(0)), "Expired");
        assert_eq!(format_time_remaining(Duration::seconds(-5)), "Expired");

        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        assert!(tokens.expiry_info().is_none());
        tokens.set_token(
            Token::from_response(response("a", Some("r"), 250), clock.now()),
            "https://auth.example.org/token",
        );
        let info = tokens.expiry_info().unwrap();
        assert!(!info.is_expired);
        assert_eq!(info.time_remaining, "4m 10s");
        assert!(info.can_refresh);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let token = Token::from_response(
            response("secret-access", Some("secret-refresh"), 60),
            Utc::now(),
        );
        let debug = format!("{:?}", token);
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
    }

    #[tokio::test]
    async fn test_no_refresh_token_fails_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        tokens.set_token(
            Token::from_response(response("a", None, 60), clock.now()),
            &format!("{}/token", server.uri()),
        );
        assert!(matches!(tokens.refresh().await, Err(SmartError::NoRefreshToken)));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "access_token": "new-access",
                        "token_type": "Bearer",
                        "expires_in": 3600
                    }))
                    .set_delay(std::time::Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        tokens.set_token(
            Token::from_response(response("old-access", Some("r1"), 10), clock.now()),
            &format!("{}/token", server.uri()),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tokens = tokens.clone();
                tokio::spawn(async move { tokens.refresh().await })
            })
            .collect();

        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.access_token, "new-access");
            // Response omitted refresh_token; the previous one is retained
            assert_eq!(token.refresh_token.as_deref(), Some("r1"));
            assert_eq!(token.patient.as_deref(), Some("p1"));
        }
        assert_eq!(
            tokens.current().unwrap().expires_at,
            Some(clock.now() + Duration::seconds(3600))
        );
    }

    async fn mount_slow_refresh(server: &MockServer, access: &str) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": access, "expires_in": 3600}))
                    .set_delay(std::time::Duration::from_millis(200)),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_logout_during_refresh_stays_logged_out() {
        let server = MockServer::start().await;
        mount_slow_refresh(&server, "revived").await;

        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        tokens.set_token(
            Token::from_response(response("a", Some("r"), 10), clock.now()),
            &format!("{}/token", server.uri()),
        );

        let refreshing = tokio::spawn({
            let tokens = tokens.clone();
            async move { tokens.refresh().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tokens.clear().unwrap();

        let result = refreshing.await.unwrap();
        assert!(matches!(result, Err(SmartError::RefreshFailed(_))));
        assert!(tokens.current().is_none());
    }

    #[tokio::test]
    async fn test_new_session_not_overwritten_by_stale_refresh() {
        let server = MockServer::start().await;
        mount_slow_refresh(&server, "stale").await;

        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        let endpoint = format!("{}/token", server.uri());
        tokens.set_token(
            Token::from_response(response("a", Some("r"), 10), clock.now()),
            &endpoint,
        );

        let refreshing = tokio::spawn({
            let tokens = tokens.clone();
            async move { tokens.refresh().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tokens.set_token(
            Token::from_response(response("fresh", Some("r-new"), 3600), clock.now()),
            &endpoint,
        );

        assert!(refreshing.await.unwrap().is_err());
        let current = tokens.current().unwrap();
        assert_eq!(current.access_token, "fresh");
        assert_eq!(current.refresh_token.as_deref(), Some("r-new"));
    }

    #[tokio::test]
    async fn test_cooldown_after_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "next",
                "expires_in": 3600,
                "refresh_token": "r2"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        tokens.set_token(
            Token::from_response(response("a", Some("r1"), 10), clock.now()),
            &format!("{}/token", server.uri()),
        );

        let first = tokens.refresh().await.unwrap();
        assert_eq!(first.refresh_token.as_deref(), Some("r2"));

        assert!(matches!(tokens.refresh().await, Err(SmartError::RefreshTooSoon)));
        clock.advance(Duration::seconds(4));
        assert!(matches!(tokens.refresh().await, Err(SmartError::RefreshTooSoon)));

        clock.advance(Duration::seconds(2));
        assert!(tokens.refresh().await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Refresh token expired"
            })))
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        tokens.set_token(
            Token::from_response(response("a", Some("r1"), 10), clock.now()),
            &format!("{}/token", server.uri()),
        );

        match tokens.refresh().await {
            Err(SmartError::RefreshFailed(msg)) => {
                assert_eq!(msg, "invalid_grant: Refresh token expired")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tokens.current().unwrap().access_token, "a");

        // No cooldown after a failure; the next attempt reaches the network again
        assert!(matches!(tokens.refresh().await, Err(SmartError::RefreshFailed(_))));
    }

    #[tokio::test]
    async fn test_access_token_refreshes_when_expiring() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        tokens.set_token(
            Token::from_response(response("stale", Some("r1"), 20), clock.now()),
            &format!("{}/token", server.uri()),
        );

        let token = tokens
            .access_token(std::time::Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(token, "fresh");
        let again = tokens
            .access_token(std::time::Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(again, "fresh");
    }

    #[tokio::test]
    async fn test_access_token_refresh_failure_is_typed() {
        let clock = Arc::new(ManualClock::default());
        let tokens = manager(clock.clone());
        tokens.set_token(
            Token::from_response(response("stale", None, 20), clock.now()),
            "https://auth.example.org/token",
        );
        assert!(matches!(
            tokens.access_token(std::time::Duration::from_secs(30)).await,
            Err(SmartError::TokenRefreshFailed(_))
        ));
    }

    #[test]
    fn test_persist_and_restore() {
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tokens = TokenLifecycleManager::with_options(
            reqwest::Client::new(),
            clock.clone(),
            "client-1",
            std::time::Duration::from_secs(5),
            Some(store.clone()),
        );
        tokens.set_token(
            Token::from_response(response("a", Some("r"), 600), clock.now()),
            "https://auth.example.org/token",
        );

        let restored = TokenLifecycleManager::with_options(
            reqwest::Client::new(),
            clock.clone(),
            "client-1",
            std::time::Duration::from_secs(5),
            Some(store.clone()),
        );
        let token = restored.restore().unwrap().unwrap();
        assert_eq!(token.access_token, "a");
        assert_eq!(
            restored.token_endpoint().as_deref(),
            Some("https://auth.example.org/token")
        );

        restored.clear().unwrap();
        assert!(restored.current().is_none());
        assert!(store.get_item(TOKEN_KEY).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_is_typed() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set_item(TOKEN_KEY, "{not json").unwrap();
        let tokens = TokenLifecycleManager::with_options(
            reqwest::Client::new(),
            Arc::new(ManualClock::default()),
            "client-1",
            std::time::Duration::from_secs(5),
            Some(store),
        );
        assert!(matches!(tokens.restore(), Err(SmartError::CorruptToken(_))));
    }
}
