//! Composition root: one object owning the token manager, the launch flow and
//! the callback handler, handed by reference to every consumer.

use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::auth_flow::{AuthorizationFlow, AuthorizationRedirect, ClientSettings, FlowPhase};
use crate::callback::{CallbackHandler, CallbackOutcome, CallbackParams};
use crate::clock::{Clock, SystemClock};
use crate::config::SmartConfig;
use crate::error::SmartError;
use crate::fhir::FhirClient;
use crate::storage::{FileStore, KeyValueStore, MemoryStore, OAuthStateStore};
use crate::token::{ExpiryInfo, Token, TokenLifecycleManager};
use crate::vendor::common::http_client;
use crate::vendor::{detect_vendor, Vendor, VendorAdapter, VendorContext};
use crate::write::audit::FanoutAuditSink;
use crate::write::{AuditSink, MemoryAuditSink, TracingAuditSink, WritePipeline};

/// Storage key for the vendor context of the active session
pub const VENDOR_CONTEXT_KEY: &str = "smart-vendor-context";

pub struct SmartSession {
    config: SmartConfig,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    tokens: TokenLifecycleManager,
    flow: AuthorizationFlow,
    callback: CallbackHandler,
    audit: Arc<dyn AuditSink>,
    audit_trail: Option<Arc<MemoryAuditSink>>,
    vendor: RwLock<Option<VendorContext>>,
}

impl SmartSession {
    pub fn new(
        config: SmartConfig,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, SmartError> {
        let http = http_client(config.request_timeout())?;
        let attempts = OAuthStateStore::new(store.clone(), clock.clone())
            .with_ttl(chrono::Duration::seconds(config.attempt_ttl_secs));
        let tokens = TokenLifecycleManager::with_options(
            http.clone(),
            clock.clone(),
            config.client_id.clone(),
            config.refresh_cooldown(),
            Some(store.clone()),
        );
        let flow = AuthorizationFlow::new(
            http.clone(),
            attempts.clone(),
            clock.clone(),
            ClientSettings {
                client_id: config.client_id.clone(),
                redirect_uri: config.redirect_uri.clone(),
                scopes: config.scopes.clone(),
                require_known_vendor: config.require_known_vendor,
            },
        );
        let callback = CallbackHandler::new(http.clone(), attempts, tokens.clone(), clock.clone());

        Ok(Self {
            config,
            http,
            clock,
            store,
            tokens,
            flow,
            callback,
            audit,
            audit_trail: None,
            vendor: RwLock::new(None),
        })
    }

    /// Wire everything from configuration: a file store under `state_dir`
    /// (memory otherwise) and an audit trail kept in memory and in the log.
    pub fn from_config(config: SmartConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.state_dir {
            Some(dir) => Arc::new(FileStore::new(dir.join("session.json"))),
            None => Arc::new(MemoryStore::new()),
        };
        let trail = Arc::new(MemoryAuditSink::new(config.audit_capacity));
        let sinks: Vec<Arc<dyn AuditSink>> = vec![trail.clone(), Arc::new(TracingAuditSink)];
        let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(sinks));
        let mut session = Self::new(config, store, Arc::new(SystemClock), audit)?;
        session.audit_trail = Some(trail);
        Ok(session)
    }

    pub fn config(&self) -> &SmartConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenLifecycleManager {
        &self.tokens
    }

    pub fn current_token(&self) -> Option<Token> {
        self.tokens.current()
    }

    pub fn expiry_info(&self) -> Option<ExpiryInfo> {
        self.tokens.expiry_info()
    }

    pub async fn refresh(&self) -> Result<Token, SmartError> {
        self.tokens.refresh().await
    }

    pub async fn begin_authorization(
        &self,
        issuer: &str,
        launch: Option<&str>,
    ) -> Result<AuthorizationRedirect, SmartError> {
        self.flow.begin(issuer, launch).await
    }

    pub fn flow_phase(&self) -> FlowPhase {
        self.flow.phase()
    }

    /// Complete the launch and remember which vendor the session belongs to
    pub async fn handle_callback(
        &self,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, SmartError> {
        let outcome = self.callback.handle(params).await?;
        if !outcome.replayed {
            self.set_vendor_context(outcome.vendor.clone());
        }
        Ok(outcome)
    }

    pub fn vendor_for(&self, issuer: &str) -> Vendor {
        detect_vendor(issuer)
    }

    pub fn adapter_for(&self, vendor: Vendor) -> VendorAdapter {
        VendorAdapter::new(vendor, self.http.clone())
    }

    pub fn vendor_context(&self) -> Option<VendorContext> {
        self.vendor.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_vendor_context(&self, context: VendorContext) {
        match serde_json::to_string(&context) {
            Ok(json) => {
                if let Err(e) = self.store.set_item(VENDOR_CONTEXT_KEY, &json) {
                    warn!("Failed to persist vendor context: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize vendor context: {}", e),
        }
        *self.vendor.write().unwrap_or_else(|e| e.into_inner()) = Some(context);
    }

    /// Reads for the active session
    pub fn fhir(&self) -> Result<FhirClient, SmartError> {
        let context = self.vendor_context().ok_or(SmartError::NotAuthenticated)?;
        Ok(FhirClient::new(self.adapter_for(context.vendor), context, self.tokens.clone())
            .with_refresh_buffer(self.config.refresh_buffer())
            .with_max_attempts(self.config.read_max_attempts))
    }

    /// Writes for the active session
    pub fn writer(&self) -> Result<WritePipeline, SmartError> {
        let context = self.vendor_context().ok_or(SmartError::NotAuthenticated)?;
        Ok(WritePipeline::new(
            self.adapter_for(context.vendor),
            context,
            self.tokens.clone(),
            self.audit.clone(),
            self.clock.clone(),
        )
        .with_refresh_buffer(self.config.refresh_buffer())
        .with_retry_policy(self.config.write_retry_policy()))
    }

    /// In-memory audit trail, when this session keeps one
    pub fn audit_trail(&self) -> Option<&MemoryAuditSink> {
        self.audit_trail.as_deref()
    }

    /// Restore a persisted session. Corrupt records are reported, not ignored.
    pub fn restore(&self) -> Result<Option<Token>, SmartError> {
        let Some(token) = self.tokens.restore()? else {
            return Ok(None);
        };
        let context = match self.store.get_item(VENDOR_CONTEXT_KEY)? {
            Some(raw) => serde_json::from_str::<VendorContext>(&raw)
                .map_err(|e| SmartError::CorruptToken(format!("vendor context: {}", e)))?,
            None => return Err(SmartError::CorruptToken("vendor context missing".into())),
        };
        info!(vendor = context.vendor.as_str(), "Session restored");
        *self.vendor.write().unwrap_or_else(|e| e.into_inner()) = Some(context);
        Ok(Some(token))
    }

    pub fn logout(&self) -> Result<(), SmartError> {
        self.tokens.clear()?;
        self.store.remove_item(VENDOR_CONTEXT_KEY)?;
        *self.vendor.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
