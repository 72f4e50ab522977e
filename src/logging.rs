//! Structured logging for the launch and session lifecycle.
//! IMPORTANT: nothing here may log a credential or PHI.
//!
//! What IS logged:
//! - Issuer URLs, vendor names, endpoint hosts
//! - Event types and outcomes (success/failure)
//! - Token lifetimes and whether a refresh token rotated
//! - HTTP statuses and sanitized error messages
//!
//! What is NOT logged:
//! - Access, refresh or ID tokens
//! - Authorization codes, PKCE verifiers, state nonces
//! - Patient or encounter identifiers
//! - Resource bodies

use anyhow::Context;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::vendor::Vendor;

/// Keeps the file writer alive so buffered lines are flushed on exit
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Console output (human-readable) plus a daily-rotated JSON file in `log_dir`
pub fn init_logging(log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "smart-launch.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(non_blocking)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!(
        event = "logging_initialized",
        log_dir = %log_dir.display(),
        "Logging initialized"
    );
    Ok(())
}

// ============================================================================
// Launch
// ============================================================================

pub fn log_launch_started(issuer: &str, vendor: Vendor) {
    info!(
        event = "launch_started",
        issuer = %issuer,
        vendor = vendor.as_str(),
        "EHR launch started"
    );
}

pub fn log_authorization_redirect(issuer: &str, vendor: Vendor, endpoint_host: &str) {
    info!(
        event = "authorization_redirect",
        issuer = %issuer,
        vendor = vendor.as_str(),
        endpoint_host = %endpoint_host,
        "Redirecting to EHR authorization server"
    );
}

pub fn log_launch_failed(issuer: &str, error: &str) {
    warn!(
        event = "launch_failed",
        issuer = %issuer,
        error = %error,
        "EHR launch failed"
    );
}

// ============================================================================
// Callback
// ============================================================================

pub fn log_callback_rejected(reason: &str) {
    warn!(
        event = "callback_rejected",
        reason = %reason,
        "Authorization callback rejected"
    );
}

pub fn log_callback_replayed() {
    info!(
        event = "callback_replayed",
        "Authorization callback already handled, not exchanging again"
    );
}

pub fn log_token_exchanged(vendor: Vendor, expires_in: Option<i64>, has_refresh_token: bool) {
    info!(
        event = "token_exchanged",
        vendor = vendor.as_str(),
        expires_in = expires_in,
        has_refresh_token = has_refresh_token,
        "Authorization code exchanged"
    );
}

// ============================================================================
// Token lifecycle
// ============================================================================

pub fn log_token_refreshed(expires_in: Option<i64>, rotated_refresh_token: bool) {
    info!(
        event = "token_refreshed",
        expires_in = expires_in,
        rotated_refresh_token = rotated_refresh_token,
        "Access token refreshed"
    );
}

pub fn log_token_refresh_failed(error: &str) {
    warn!(
        event = "token_refresh_failed",
        error = %error,
        "Access token refresh failed"
    );
}

pub fn log_session_restored(expired: bool) {
    info!(
        event = "session_restored",
        expired = expired,
        "Restored persisted token"
    );
}

pub fn log_session_cleared() {
    info!(event = "session_cleared", "Session cleared");
}

// ============================================================================
// FHIR access
// ============================================================================

pub fn log_fhir_retry(resource_type: &str, attempt: u32, reason: &str) {
    warn!(
        event = "fhir_read_retry",
        resource_type = %resource_type,
        attempt = attempt,
        reason = %reason,
        "Retrying FHIR read"
    );
}
