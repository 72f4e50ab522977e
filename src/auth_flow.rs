//! EHR launch → authorization redirect
//!
//! A single pass through `Idle → Discovering → Preparing → Redirecting`, or into
//! `Failed`. Nothing here retries: a failed launch needs a fresh launch from
//! the EHR.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::debug;
use url::Url;

use crate::clock::Clock;
use crate::error::SmartError;
use crate::logging;
use crate::pkce::{generate_state, PkceChallenge};
use crate::storage::{OAuthAttempt, OAuthStateStore};
use crate::vendor::{AuthorizationParams, Vendor, VendorAdapter, VendorContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "detail", rename_all = "lowercase")]
pub enum FlowPhase {
    Idle,
    Discovering,
    Preparing,
    Redirecting,
    Failed(String),
}

/// Client registration used for every launch
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Refuse issuers that match none of the known vendors
    pub require_known_vendor: bool,
}

/// Where to send the browser next
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: Url,
    pub state: String,
    pub vendor: VendorContext,
}

pub struct AuthorizationFlow {
    http: reqwest::Client,
    attempts: OAuthStateStore,
    clock: Arc<dyn Clock>,
    settings: ClientSettings,
    phase: Mutex<FlowPhase>,
}

impl AuthorizationFlow {
    pub fn new(
        http: reqwest::Client,
        attempts: OAuthStateStore,
        clock: Arc<dyn Clock>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            http,
            attempts,
            clock,
            settings,
            phase: Mutex::new(FlowPhase::Idle),
        }
    }

    /// Phase reached by the most recent launch
    pub fn phase(&self) -> FlowPhase {
        self.phase.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn enter(&self, phase: FlowPhase) {
        debug!(?phase, "Authorization flow phase");
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Run the launch sequence for `issuer`, ending in a redirect to the EHR
    pub async fn begin(
        &self,
        issuer: &str,
        launch: Option<&str>,
    ) -> Result<AuthorizationRedirect, SmartError> {
        self.enter(FlowPhase::Idle);
        match self.run(issuer, launch).await {
            Ok(redirect) => {
                self.enter(FlowPhase::Redirecting);
                Ok(redirect)
            }
            Err(e) => {
                logging::log_launch_failed(issuer, &e.to_string());
                self.enter(FlowPhase::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        issuer: &str,
        launch: Option<&str>,
    ) -> Result<AuthorizationRedirect, SmartError> {
        let issuer = issuer.trim();
        if issuer.is_empty() {
            return Err(SmartError::Discovery {
                issuer: String::new(),
                reason: "missing iss parameter".into(),
            });
        }
        Url::parse(issuer).map_err(|e| SmartError::Discovery {
            issuer: issuer.to_string(),
            reason: format!("invalid issuer URL: {}", e),
        })?;

        let context = VendorContext::from_issuer(issuer);
        if self.settings.require_known_vendor && context.vendor == Vendor::Unknown {
            return Err(SmartError::UnsupportedVendor(context.issuer));
        }
        let adapter = VendorAdapter::new(context.vendor, self.http.clone());
        logging::log_launch_started(&context.issuer, context.vendor);

        self.enter(FlowPhase::Discovering);
        let discovery = adapter.fetch_discovery_metadata(&context.issuer).await?;

        self.enter(FlowPhase::Preparing);
        let pkce = PkceChallenge::generate()?;
        let state = generate_state()?;
        let launch = launch.map(str::trim).filter(|l| !l.is_empty()).map(str::to_string);

        let attempt = OAuthAttempt {
            state: state.clone(),
            code_verifier: pkce.code_verifier.clone(),
            issuer: context.issuer.clone(),
            launch_context: launch.clone(),
            redirect_uri: self.settings.redirect_uri.clone(),
            token_endpoint: discovery.token_endpoint.clone(),
            created_at: self.clock.now(),
        };
        self.attempts.save(&attempt)?;

        let params = AuthorizationParams {
            issuer: context.issuer.clone(),
            client_id: self.settings.client_id.clone(),
            redirect_uri: self.settings.redirect_uri.clone(),
            scopes: self.settings.scopes.clone(),
            launch,
            state: state.clone(),
            code_challenge: pkce.code_challenge,
        };
        let url = adapter.build_authorization_url(&discovery, &params)?;

        logging::log_authorization_redirect(
            &context.issuer,
            context.vendor,
            url.host_str().unwrap_or_default(),
        );
        Ok(AuthorizationRedirect {
            url,
            state,
            vendor: context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pkce::verify_challenge;
    use crate::storage::{KeyValueStore, MemoryStore};
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn flow(store: Arc<dyn KeyValueStore>, clock: Arc<ManualClock>) -> AuthorizationFlow {
        AuthorizationFlow::new(
            reqwest::Client::new(),
            OAuthStateStore::new(store, clock.clone()),
            clock,
            ClientSettings {
                client_id: "client-1".into(),
                redirect_uri: "http://127.0.0.1:8765/callback".into(),
                scopes: vec!["launch".into(), "patient/Observation.read".into()],
                require_known_vendor: false,
            },
        )
    }

    async fn discovery_server(fhir_path: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/.well-known/smart-configuration", fhir_path)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authorization_endpoint": format!("{}/authorize", server.uri()),
                "token_endpoint": format!("{}/token", server.uri())
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_begin_stores_attempt_and_builds_url() {
        let server = discovery_server("/fhir").await;
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let flow = flow(store.clone(), clock.clone());

        let issuer = format!("{}/fhir", server.uri());
        let redirect = flow.begin(&issuer, Some("launch-123")).await.unwrap();
        assert_eq!(flow.phase(), FlowPhase::Redirecting);

        let pairs: HashMap<String, String> = redirect.url.query_pairs().into_owned().collect();
        assert_eq!(pairs["aud"], issuer);
        assert_eq!(pairs["launch"], "launch-123");
        assert_eq!(pairs["state"], redirect.state);
        // Unknown vendor keeps standard scope grammar
        assert_eq!(pairs["scope"], "launch patient/Observation.read");

        let attempt = OAuthStateStore::new(store, clock).load().unwrap();
        assert_eq!(attempt.state, redirect.state);
        assert_eq!(attempt.token_endpoint, format!("{}/token", server.uri()));
        assert_eq!(attempt.launch_context.as_deref(), Some("launch-123"));
        assert!(verify_challenge(&attempt.code_verifier, &pairs["code_challenge"]));
    }

    #[tokio::test]
    async fn test_each_launch_gets_a_fresh_state() {
        let server = discovery_server("/fhir").await;
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let flow = flow(store, Arc::new(ManualClock::default()));
        let issuer = format!("{}/fhir", server.uri());

        let first = flow.begin(&issuer, None).await.unwrap();
        let second = flow.begin(&issuer, None).await.unwrap();
        assert_ne!(first.state, second.state);
        assert!(!second.url.query_pairs().any(|(k, _)| k == "launch"));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let flow = flow(store.clone(), clock.clone());

        let result = flow.begin(&server.uri(), Some("x")).await;
        assert!(matches!(result, Err(SmartError::Discovery { .. })));
        assert!(matches!(flow.phase(), FlowPhase::Failed(_)));
        assert!(matches!(
            OAuthStateStore::new(store, clock).load(),
            Err(SmartError::MissingFlowState)
        ));
    }

    #[tokio::test]
    async fn test_missing_issuer_rejected() {
        let flow = flow(Arc::new(MemoryStore::new()), Arc::new(ManualClock::default()));
        assert!(matches!(
            flow.begin("  ", None).await,
            Err(SmartError::Discovery { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_vendor_refused_when_required() {
        let clock = Arc::new(ManualClock::default());
        let mut flow = flow(Arc::new(MemoryStore::new()), clock);
        flow.settings.require_known_vendor = true;

        let result = flow.begin("https://fhir.example.org/r4", None).await;
        assert!(matches!(result, Err(SmartError::UnsupportedVendor(_))));
        assert!(matches!(flow.phase(), FlowPhase::Failed(_)));
    }
}
