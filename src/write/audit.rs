//! PHI access audit trail
//!
//! Entries are append-only. The pipeline writes one per write/delete attempt;
//! nothing in this crate mutates or removes an entry once recorded, apart from
//! the memory sink evicting its oldest entries when full.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::SmartError;
use crate::vendor::Vendor;

/// Entries kept by [`MemoryAuditSink`] unless configured otherwise
pub const DEFAULT_AUDIT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Read,
    Write,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Read => "read",
            AuditAction::Write => "write",
            AuditAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub user_role: String,
    pub patient_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: AuditAction,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub issuer: String,
    pub vendor: Vendor,
    pub metadata: Value,
}

/// Destination for audit entries
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditLogEntry) -> Result<(), SmartError>;
}

/// Bounded in-memory trail; the oldest entries are evicted first
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    entries: Mutex<VecDeque<AuditLogEntry>>,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditLogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn for_patient(&self, patient_id: &str) -> Vec<AuditLogEntry> {
        self.filtered(|e| e.patient_id == patient_id)
    }

    pub fn for_user(&self, user_id: &str) -> Vec<AuditLogEntry> {
        self.filtered(|e| e.user_id == user_id)
    }

    /// Write and delete entries only
    pub fn writes(&self) -> Vec<AuditLogEntry> {
        self.filtered(|e| matches!(e.action, AuditAction::Write | AuditAction::Delete))
    }

    fn filtered(&self, pred: impl Fn(&AuditLogEntry) -> bool) -> Vec<AuditLogEntry> {
        self.lock().iter().filter(|e| pred(e)).cloned().collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditLogEntry) -> Result<(), SmartError> {
        let mut entries = self.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }
}

/// Emits each entry as a structured `audit` event, picked up by the JSON file log
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditLogEntry) -> Result<(), SmartError> {
        info!(
            target: "audit",
            event = "phi_access",
            audit_id = %entry.id,
            user_id = %entry.user_id,
            user_role = %entry.user_role,
            patient_id = %entry.patient_id,
            resource_type = %entry.resource_type,
            resource_id = %entry.resource_id,
            action = entry.action.as_str(),
            vendor = entry.vendor.as_str(),
            issuer = %entry.issuer,
            metadata = %entry.metadata,
            "Audit entry recorded"
        );
        Ok(())
    }
}

/// Fans one entry out to several sinks; the first failure is reported
/// after every sink has been tried
pub struct FanoutAuditSink {
    sinks: Vec<std::sync::Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn record(&self, entry: AuditLogEntry) -> Result<(), SmartError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(entry.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn entry(user: &str, patient: &str, action: AuditAction) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            user_id: user.into(),
            user_name: "Dr. Test".into(),
            user_role: "clinician".into(),
            patient_id: patient.into(),
            resource_type: "Observation".into(),
            resource_id: "1".into(),
            action,
            ip_address: None,
            user_agent: None,
            timestamp: Utc::now(),
            issuer: "https://fhir.epic.com/api/FHIR/R4".into(),
            vendor: Vendor::Epic,
            metadata: json!({"operation": "create"}),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_is_bounded() {
        let sink = MemoryAuditSink::new(3);
        for i in 0..5 {
            sink.record(entry(&format!("u{}", i), "p", AuditAction::Write))
                .await
                .unwrap();
        }
        let users: Vec<String> = sink.entries().into_iter().map(|e| e.user_id).collect();
        assert_eq!(users, vec!["u2", "u3", "u4"]);
    }

    #[tokio::test]
    async fn test_memory_sink_filters() {
        let sink = MemoryAuditSink::default();
        sink.record(entry("u1", "p1", AuditAction::Read)).await.unwrap();
        sink.record(entry("u1", "p2", AuditAction::Write)).await.unwrap();
        sink.record(entry("u2", "p1", AuditAction::Delete)).await.unwrap();

        assert_eq!(sink.for_patient("p1").len(), 2);
        assert_eq!(sink.for_user("u1").len(), 2);
        assert_eq!(sink.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAuditSink::default());
        let b = Arc::new(MemoryAuditSink::default());
        let sinks: Vec<Arc<dyn AuditSink>> = vec![a.clone(), b.clone(), Arc::new(TracingAuditSink)];
        let fanout = FanoutAuditSink::new(sinks);
        fanout.record(entry("u1", "p1", AuditAction::Write)).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let value = serde_json::to_value(entry("u1", "p1", AuditAction::Delete)).unwrap();
        assert_eq!(value["action"], "delete");
        assert_eq!(value["vendor"], "epic");
        assert!(value.get("patientId").is_some());
    }
}
