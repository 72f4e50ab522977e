//! Shape checks run before any write leaves the process.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fatal,
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Error messages joined for display
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            severity: Severity::Error,
        });
    }

    fn warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            severity: Severity::Warning,
        });
    }

    fn require(&mut self, resource: &Value, resource_type: &str, field: &str) {
        if !present(resource, field) {
            self.error(field, format!("{}.{} is required", resource_type, field));
        }
    }
}

/// Present and not null/empty
fn present(resource: &Value, field: &str) -> bool {
    match resource.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(_) => true,
    }
}

/// Validate a FHIR resource against the per-type required fields.
/// Unknown resource types only need a `resourceType`.
pub fn validate_resource(resource: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();

    let Some(resource_type) = resource["resourceType"].as_str().filter(|s| !s.is_empty()) else {
        report.errors.push(ValidationIssue {
            field: "resourceType".into(),
            message: "resourceType is required".into(),
            severity: Severity::Fatal,
        });
        return report;
    };

    match resource_type {
        "Patient" => {
            if !present(resource, "identifier") && !present(resource, "name") {
                report.error(
                    "identifier/name",
                    "Patient must have at least one identifier or name",
                );
            }
            if !present(resource, "gender") {
                report.warning("gender", "Patient should have a gender specified");
            }
        }
        "Observation" => {
            for field in ["status", "code", "subject"] {
                report.require(resource, resource_type, field);
            }
            let has_value = resource
                .as_object()
                .map(|o| o.keys().any(|k| k.starts_with("value")))
                .unwrap_or(false);
            if !has_value && !present(resource, "component") {
                report.warning(
                    "value/component",
                    "Observation should have either a value or components",
                );
            }
        }
        "DocumentReference" => {
            report.require(resource, resource_type, "status");
            match resource["content"].as_array() {
                Some(content) if !content.is_empty() => {
                    for (i, item) in content.iter().enumerate() {
                        if !present(item, "attachment") {
                            report.error(
                                format!("content[{}].attachment", i),
                                format!("DocumentReference.content[{}] must have an attachment", i),
                            );
                        }
                    }
                }
                _ => report.error(
                    "content",
                    "DocumentReference.content is required and must have at least one entry",
                ),
            }
            report.require(resource, resource_type, "subject");
        }
        "MedicationRequest" => {
            report.require(resource, resource_type, "status");
            report.require(resource, resource_type, "intent");
            if !present(resource, "medicationCodeableConcept")
                && !present(resource, "medicationReference")
            {
                report.error(
                    "medication",
                    "MedicationRequest must have medicationCodeableConcept or medicationReference",
                );
            }
            report.require(resource, resource_type, "subject");
            if !present(resource, "dosageInstruction") {
                report.warning(
                    "dosageInstruction",
                    "MedicationRequest should include dosage instructions",
                );
            }
        }
        "AllergyIntolerance" => {
            report.require(resource, resource_type, "patient");
            report.require(resource, resource_type, "code");
            if !present(resource, "clinicalStatus") {
                report.warning("clinicalStatus", "AllergyIntolerance should have a clinicalStatus");
            }
        }
        "Condition" => {
            report.require(resource, resource_type, "subject");
            report.require(resource, resource_type, "code");
            if !present(resource, "clinicalStatus") {
                report.warning("clinicalStatus", "Condition should have a clinicalStatus");
            }
        }
        _ => {}
    }

    report
}
