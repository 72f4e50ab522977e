//! Authenticated FHIR reads and searches
//!
//! Each request first makes sure the token is not about to expire, refreshing
//! through the lifecycle manager if needed; a failed refresh aborts the read.
//! Failures are then classified:
//! - 401: one forced refresh, then one more try
//! - 403: returned as-is, never retried
//! - 5xx / 429 / transport: retried with backoff
//! - anything else: returned as-is
//!
//! No request is sent more than `max_attempts` times.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::SmartError;
use crate::logging;
use crate::token::{TokenLifecycleManager, DEFAULT_REFRESH_BUFFER_SECS};
use crate::vendor::common::build_search_url;
use crate::vendor::{VendorAdapter, VendorContext};

pub const DEFAULT_READ_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay
const MAX_BACKOFF_MS: u64 = 5000;

/// Page size requested by the patient-scoped searches
const SEARCH_PAGE_SIZE: &str = "100";

/// `rate_limit_absorbed`: the adapter already waited out a 429 before giving up
fn is_retryable(err: &SmartError, rate_limit_absorbed: bool) -> bool {
    match err {
        SmartError::Network(e) => {
            e.is_connect()
                || e.is_timeout()
                || e.status()
                    .map(|s| s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS)
                    .unwrap_or(false)
        }
        SmartError::VendorRateLimit { .. } => !rate_limit_absorbed,
        _ => err
            .status()
            .map(|s| s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS)
            .unwrap_or(false),
    }
}

/// Exponential backoff with jitter
fn calculate_backoff(initial_ms: u64, attempt: u32) -> Duration {
    let base_delay = initial_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped_delay = base_delay.min(MAX_BACKOFF_MS);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_millis() as u64)
        % 100;
    Duration::from_millis(capped_delay + jitter)
}

/// FHIR ids and resource types are restricted to a safe character set
fn check_path_segment(kind: &str, value: &str) -> Result<(), SmartError> {
    let valid = !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(SmartError::Validation(format!("invalid {}: {:?}", kind, value)))
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadKind {
    Read,
    Search,
}

/// Read access to one vendor's FHIR server for the current session
#[derive(Debug, Clone)]
pub struct FhirClient {
    adapter: VendorAdapter,
    context: VendorContext,
    tokens: TokenLifecycleManager,
    refresh_buffer: Duration,
    max_attempts: u32,
    initial_backoff_ms: u64,
}

impl FhirClient {
    pub fn new(
        adapter: VendorAdapter,
        context: VendorContext,
        tokens: TokenLifecycleManager,
    ) -> Self {
        Self {
            adapter,
            context,
            tokens,
            refresh_buffer: Duration::from_secs(DEFAULT_REFRESH_BUFFER_SECS),
            max_attempts: DEFAULT_READ_MAX_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self
    }

    pub fn context(&self) -> &VendorContext {
        &self.context
    }

    pub fn base_url(&self) -> &str {
        &self.context.issuer
    }

    /// `GET {base}/{type}/{id}`
    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Value, SmartError> {
        check_path_segment("resource type", resource_type)?;
        check_path_segment("resource id", id)?;
        let url = format!("{}/{}/{}", self.base_url(), resource_type, id);
        self.execute(ReadKind::Read, resource_type, &url).await
    }

    /// `GET {base}/{type}?params`, skipping empty parameters
    pub async fn search(
        &self,
        resource_type: &str,
        params: &[(&str, Option<String>)],
    ) -> Result<Value, SmartError> {
        check_path_segment("resource type", resource_type)?;
        let url = build_search_url(self.base_url(), resource_type, params)?;
        self.execute(ReadKind::Search, resource_type, url.as_str()).await
    }

    /// Patient selected at launch
    pub async fn launch_patient(&self) -> Result<Value, SmartError> {
        let patient = self.launch_patient_id()?;
        self.read("Patient", &patient).await
    }

    /// Encounter selected at launch, if the EHR supplied one
    pub async fn launch_encounter(&self) -> Result<Option<Value>, SmartError> {
        let encounter = self
            .tokens
            .current()
            .ok_or(SmartError::NotAuthenticated)?
            .encounter;
        match encounter {
            Some(id) => self.read("Encounter", &id).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn observations(&self, category: Option<&str>) -> Result<Value, SmartError> {
        self.patient_search("Observation", &[("category", category.map(str::to_string))])
            .await
    }

    pub async fn medication_requests(&self) -> Result<Value, SmartError> {
        self.patient_search("MedicationRequest", &[]).await
    }

    pub async fn conditions(&self) -> Result<Value, SmartError> {
        self.patient_search("Condition", &[]).await
    }

    pub async fn allergies(&self) -> Result<Value, SmartError> {
        self.patient_search("AllergyIntolerance", &[]).await
    }

    pub async fn immunizations(&self) -> Result<Value, SmartError> {
        self.patient_search("Immunization", &[]).await
    }

    fn launch_patient_id(&self) -> Result<String, SmartError> {
        self.tokens
            .current()
            .ok_or(SmartError::NotAuthenticated)?
            .patient
            .ok_or_else(|| SmartError::Validation("launch context has no patient".into()))
    }

    async fn patient_search(
        &self,
        resource_type: &str,
        extra: &[(&str, Option<String>)],
    ) -> Result<Value, SmartError> {
        let patient = self.launch_patient_id()?;
        let mut params: Vec<(&str, Option<String>)> = vec![("patient", Some(patient))];
        params.extend(extra.iter().cloned());
        params.push(("_count", Some(SEARCH_PAGE_SIZE.to_string())));
        self.search(resource_type, &params).await
    }

    async fn execute(
        &self,
        kind: ReadKind,
        resource_type: &str,
        url: &str,
    ) -> Result<Value, SmartError> {
        let mut attempt: u32 = 0;
        let mut forced_refresh = false;

        loop {
            attempt += 1;
            let token = self.tokens.access_token(self.refresh_buffer).await?;
            debug!(resource_type, attempt, ?kind, "FHIR request");

            let result = match kind {
                ReadKind::Read => self.adapter.read_resource(url, &token).await,
                ReadKind::Search => self.adapter.search_resources(url, &token).await,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= self.max_attempts {
                error!(resource_type, attempt, error = %err, "FHIR request failed");
                return Err(err);
            }

            match err.status() {
                Some(reqwest::StatusCode::UNAUTHORIZED) if !forced_refresh => {
                    forced_refresh = true;
                    logging::log_fhir_retry(resource_type, attempt, "401, forcing token refresh");
                    match self.tokens.refresh().await {
                        Ok(_) | Err(SmartError::RefreshTooSoon) => {}
                        Err(e) => return Err(SmartError::TokenRefreshFailed(e.to_string())),
                    }
                }
                Some(reqwest::StatusCode::UNAUTHORIZED) | Some(reqwest::StatusCode::FORBIDDEN) => {
                    return Err(err)
                }
                _ if is_retryable(&err, self.adapter.absorbs_rate_limit()) => {
                    let backoff = calculate_backoff(self.initial_backoff_ms, attempt - 1);
                    logging::log_fhir_retry(resource_type, attempt, &err.to_string());
                    tokio::time::sleep(backoff).await;
                }
                _ => return Err(err),
            }
        }
    }
}
