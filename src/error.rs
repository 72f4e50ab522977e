//! Error taxonomy for the launch, token and FHIR layers.

use reqwest::StatusCode;

/// SMART-on-FHIR client errors
#[derive(Debug, thiserror::Error)]
pub enum SmartError {
    #[error("SMART discovery failed for {issuer}: {reason}")]
    Discovery { issuer: String, reason: String },

    #[error("State parameter mismatch - possible CSRF attack")]
    StateMismatch,

    #[error("No pending authorization found (storage cleared or different tab)")]
    MissingFlowState,

    #[error("Authorization attempt expired after {age_secs}s")]
    ExpiredFlowState { age_secs: i64 },

    #[error("Stored authorization attempt is corrupt: {0}")]
    CorruptFlowState(String),

    #[error("Stored token record is corrupt: {0}")]
    CorruptToken(String),

    #[error("Authorization server returned {error}: {description}")]
    AuthorizationDenied { error: String, description: String },

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Token was recently refreshed. Please try again.")]
    RefreshTooSoon,

    #[error("Token refresh failed before FHIR request: {0}")]
    TokenRefreshFailed(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Version conflict on {resource}: resource was modified by another user. Refetch and retry.")]
    VersionConflict { resource: String },

    #[error("Invalid FHIR resource: {0}")]
    Validation(String),

    #[error("{vendor} rate limit exceeded: {message}")]
    VendorRateLimit { vendor: String, message: String },

    #[error("{vendor} does not support writing {resource_type}")]
    UnsupportedWrite { vendor: String, resource_type: String },

    #[error("Unsupported vendor: {0}")]
    UnsupportedVendor(String),

    #[error("{message}")]
    Vendor {
        status: Option<StatusCode>,
        message: String,
    },

    #[error("HTTP {status}: {message}")]
    Http { status: StatusCode, message: String },

    #[error("Secure random source unavailable: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(String),
}

impl SmartError {
    /// Errors that end the launch or session. The user has to return to the EHR
    /// and relaunch; nothing about them is retried automatically.
    pub fn requires_relaunch(&self) -> bool {
        matches!(
            self,
            SmartError::Discovery { .. }
                | SmartError::StateMismatch
                | SmartError::MissingFlowState
                | SmartError::ExpiredFlowState { .. }
                | SmartError::CorruptFlowState(_)
                | SmartError::CorruptToken(_)
                | SmartError::AuthorizationDenied { .. }
                | SmartError::TokenExchange(_)
                | SmartError::NoRefreshToken
                | SmartError::RefreshFailed(_)
                | SmartError::TokenRefreshFailed(_)
                | SmartError::NotAuthenticated
                | SmartError::UnsupportedVendor(_)
        )
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            SmartError::Http { status, .. } => Some(*status),
            SmartError::Vendor { status, .. } => *status,
            SmartError::Network(e) => e.status(),
            SmartError::VendorRateLimit { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            _ => None,
        }
    }
}

impl From<url::ParseError> for SmartError {
    fn from(e: url::ParseError) -> Self {
        SmartError::Url(e.to_string())
    }
}
