//! FHIR write pipeline
//!
//! Every create/update/delete goes through the same sequence:
//! 1. vendor write-capability check (local rejection, no HTTP call)
//! 2. resource validation (fatal, never retried)
//! 3. the HTTP call with vendor headers
//! 4. exactly one audit entry, written before the result is returned
//!
//! Expected failures (4xx, 409) come back as an unsuccessful [`WriteResult`];
//! only local rejections and transport failures are `Err`.

pub mod audit;
pub mod retry;
pub mod validation;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::SmartError;
use crate::token::TokenLifecycleManager;
use crate::vendor::{VendorAdapter, VendorContext};

pub use audit::{AuditAction, AuditLogEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use retry::{retry_write_operation, RetryPolicy};
pub use validation::{validate_resource, ValidationIssue, ValidationReport};

/// Outcome of one write
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_outcome: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// `ResourceType/id` the write addressed, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// An update rejected with 409 because the stored version moved on
    #[serde(default)]
    pub version_conflict: bool,
}

impl WriteResult {
    pub fn is_version_conflict(&self) -> bool {
        self.version_conflict
    }

    /// Typed error for an unsuccessful result
    pub fn to_error(&self) -> Option<SmartError> {
        if self.success {
            return None;
        }
        if self.is_version_conflict() {
            return Some(SmartError::VersionConflict {
                resource: self.target.clone().unwrap_or_default(),
            });
        }
        let message = self
            .error_message
            .clone()
            .unwrap_or_else(|| "Write failed".to_string());
        Some(
            match self
                .status_code
                .and_then(|c| reqwest::StatusCode::from_u16(c).ok())
            {
                Some(status) => SmartError::Http { status, message },
                None => SmartError::Vendor {
                    status: None,
                    message,
                },
            },
        )
    }
}

/// Who is writing, for audit attribution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteContext {
    pub user_id: String,
    pub user_name: String,
    pub user_role: Option<String>,
    pub patient_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Explicit `If-Match` value; otherwise derived from `meta.versionId`
    pub if_match: Option<String>,
    /// Opt out of the audit entry for this call
    pub skip_audit: bool,
}

/// Validate → call → audit, for one vendor session
#[derive(Clone)]
pub struct WritePipeline {
    adapter: VendorAdapter,
    context: VendorContext,
    tokens: TokenLifecycleManager,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    refresh_buffer: Duration,
    retry_policy: RetryPolicy,
}

/// What the audit entry needs to know about one attempt
struct Attempt<'a> {
    resource_type: &'a str,
    resource_id: Option<&'a str>,
    action: AuditAction,
    operation: &'static str,
    patient_id: Option<String>,
    version_id: Option<String>,
}

impl WritePipeline {
    pub fn new(
        adapter: VendorAdapter,
        context: VendorContext,
        tokens: TokenLifecycleManager,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            adapter,
            context,
            tokens,
            audit,
            clock,
            refresh_buffer: Duration::from_secs(crate::token::DEFAULT_REFRESH_BUFFER_SECS),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Backoff configured for this session, for use with [`retry_write_operation`]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn adapter(&self) -> &VendorAdapter {
        &self.adapter
    }

    pub async fn create(
        &self,
        resource_type: &str,
        resource: &Value,
        ctx: &WriteContext,
        options: &WriteOptions,
    ) -> Result<WriteResult, SmartError> {
        let attempt = Attempt {
            resource_type,
            resource_id: None,
            action: AuditAction::Write,
            operation: "create",
            patient_id: ctx.patient_id.clone().or_else(|| extract_patient_id(resource)),
            version_id: None,
        };

        let result = match self.prepare(resource_type, Some(resource)).await {
            Ok(token) => {
                self.adapter
                    .create_resource(&self.context.issuer, resource_type, resource, &token)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(attempt, ctx, options, result).await
    }

    pub async fn update(
        &self,
        resource_type: &str,
        resource_id: &str,
        resource: &Value,
        ctx: &WriteContext,
        options: &WriteOptions,
    ) -> Result<WriteResult, SmartError> {
        let version_id = resource["meta"]["versionId"].as_str().map(str::to_string);
        let if_match = options
            .if_match
            .clone()
            .or_else(|| version_id.as_ref().map(|v| format!("W/\"{}\"", v)));
        let attempt = Attempt {
            resource_type,
            resource_id: Some(resource_id),
            action: AuditAction::Write,
            operation: "update",
            patient_id: ctx.patient_id.clone().or_else(|| extract_patient_id(resource)),
            version_id,
        };

        let result = match self.prepare(resource_type, Some(resource)).await {
            Ok(token) => {
                self.adapter
                    .update_resource(
                        &self.context.issuer,
                        resource_type,
                        resource_id,
                        resource,
                        &token,
                        if_match.as_deref(),
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(attempt, ctx, options, result).await
    }

    pub async fn delete(
        &self,
        resource_type: &str,
        resource_id: &str,
        ctx: &WriteContext,
        options: &WriteOptions,
    ) -> Result<WriteResult, SmartError> {
        let attempt = Attempt {
            resource_type,
            resource_id: Some(resource_id),
            action: AuditAction::Delete,
            operation: "delete",
            patient_id: ctx.patient_id.clone(),
            version_id: None,
        };

        let result = match self.prepare(resource_type, None).await {
            Ok(token) => {
                self.adapter
                    .delete_resource(&self.context.issuer, resource_type, resource_id, &token)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(attempt, ctx, options, result).await
    }

    /// Local checks, then a token that is not about to expire
    async fn prepare(
        &self,
        resource_type: &str,
        resource: Option<&Value>,
    ) -> Result<String, SmartError> {
        if !self.adapter.supports_write(resource_type) {
            return Err(SmartError::UnsupportedWrite {
                vendor: self.adapter.vendor().display_name().to_string(),
                resource_type: resource_type.to_string(),
            });
        }

        if let Some(resource) = resource {
            if resource["resourceType"].as_str() != Some(resource_type) {
                return Err(SmartError::Validation(format!(
                    "resourceType must be {}",
                    resource_type
                )));
            }
            let report = validate_resource(resource);
            for warning in &report.warnings {
                warn!(field = %warning.field, "{}", warning.message);
            }
            if !report.is_valid() {
                return Err(SmartError::Validation(report.error_summary()));
            }
        }

        self.tokens.access_token(self.refresh_buffer).await
    }

    /// Shape the result, then audit it. Runs for every outcome, including
    /// local rejections and transport failures.
    async fn finish(
        &self,
        attempt: Attempt<'_>,
        ctx: &WriteContext,
        options: &WriteOptions,
        result: Result<WriteResult, SmartError>,
    ) -> Result<WriteResult, SmartError> {
        let target = match attempt.resource_id {
            Some(id) => format!("{}/{}", attempt.resource_type, id),
            None => attempt.resource_type.to_string(),
        };

        let result = result.map(|mut r| {
            r.target = Some(target.clone());
            // A 409 on create or delete is a duplicate or state clash, not a stale version
            if attempt.operation == "update" && r.status_code == Some(409) {
                r.version_conflict = true;
                r.success = false;
                r.error_message = Some(
                    SmartError::VersionConflict {
                        resource: target.clone(),
                    }
                    .to_string(),
                );
            }
            r
        });

        match &result {
            Ok(r) if r.success => info!(
                event = "fhir_write",
                operation = attempt.operation,
                resource_type = attempt.resource_type,
                status = r.status_code,
                "FHIR write succeeded"
            ),
            Ok(r) => warn!(
                event = "fhir_write",
                operation = attempt.operation,
                resource_type = attempt.resource_type,
                status = r.status_code,
                "FHIR write rejected"
            ),
            Err(e) => warn!(
                event = "fhir_write",
                operation = attempt.operation,
                resource_type = attempt.resource_type,
                error = %e,
                "FHIR write failed"
            ),
        }

        if !options.skip_audit {
            let entry = self.audit_entry(&attempt, ctx, &result);
            if let Err(e) = self.audit.record(entry).await {
                error!(error = %e, "Failed to record audit entry");
            }
        }

        result
    }

    fn audit_entry(
        &self,
        attempt: &Attempt<'_>,
        ctx: &WriteContext,
        result: &Result<WriteResult, SmartError>,
    ) -> AuditLogEntry {
        let (success, status_code, error) = match result {
            Ok(r) => (r.success, r.status_code, r.error_message.clone()),
            Err(e) => (false, e.status().map(|s| s.as_u16()), Some(e.to_string())),
        };
        let resource_id = attempt
            .resource_id
            .map(str::to_string)
            .or_else(|| {
                result
                    .as_ref()
                    .ok()
                    .and_then(|r| r.resource.as_ref())
                    .and_then(|r| r["id"].as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "creating".to_string());

        AuditLogEntry {
            id: uuid::Uuid::new_v4(),
            user_id: ctx.user_id.clone(),
            user_name: ctx.user_name.clone(),
            user_role: ctx.user_role.clone().unwrap_or_else(|| "clinician".to_string()),
            patient_id: attempt
                .patient_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            resource_type: attempt.resource_type.to_string(),
            resource_id,
            action: attempt.action,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            timestamp: self.clock.now(),
            issuer: self.context.issuer.clone(),
            vendor: self.context.vendor,
            metadata: json!({
                "operation": attempt.operation,
                "success": success,
                "statusCode": status_code,
                "versionId": attempt.version_id,
                "error": error,
            }),
        }
    }
}

/// Patient id from `subject`/`patient` references, or the id of a Patient
pub fn extract_patient_id(resource: &Value) -> Option<String> {
    for field in ["subject", "patient"] {
        if let Some(reference) = resource[field]["reference"].as_str() {
            if let Some(id) = reference
                .split('/')
                .skip_while(|s| *s != "Patient")
                .nth(1)
                .filter(|s| !s.is_empty())
            {
                return Some(id.to_string());
            }
        }
    }
    if resource["resourceType"].as_str() == Some("Patient") {
        return resource["id"].as_str().map(str::to_string);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_patient_id() {
        assert_eq!(
            extract_patient_id(&json!({"subject": {"reference": "Patient/123"}})).as_deref(),
            Some("123")
        );
        assert_eq!(
            extract_patient_id(&json!({
                "patient": {"reference": "https://fhir.example.org/r4/Patient/abc"}
            }))
            .as_deref(),
            Some("abc")
        );
        assert_eq!(
            extract_patient_id(&json!({"resourceType": "Patient", "id": "p1"})).as_deref(),
            Some("p1")
        );
        assert_eq!(
            extract_patient_id(&json!({"subject": {"reference": "Group/9"}})),
            None
        );
    }

    #[test]
    fn test_conflict_result_maps_to_typed_error() {
        let result = WriteResult {
            success: false,
            status_code: Some(409),
            target: Some("Observation/1".into()),
            version_conflict: true,
            ..Default::default()
        };
        assert!(result.is_version_conflict());
        match result.to_error() {
            Some(SmartError::VersionConflict { resource }) => assert_eq!(resource, "Observation/1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plain_409_is_http_conflict() {
        let result = WriteResult {
            success: false,
            status_code: Some(409),
            error_message: Some("Duplicate resource".into()),
            ..Default::default()
        };
        assert!(!result.is_version_conflict());
        assert!(matches!(
            result.to_error(),
            Some(SmartError::Http { status: reqwest::StatusCode::CONFLICT, .. })
        ));
    }

    #[test]
    fn test_success_has_no_error() {
        let result = WriteResult {
            success: true,
            status_code: Some(201),
            ..Default::default()
        };
        assert!(result.to_error().is_none());
    }
}
