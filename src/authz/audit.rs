//! Structured decision log, for answering "why was this denied".

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum BindingResult {
    Passed,
    Failed,
    /// Guest principal on a binding that does not allow guests
    GuestRejected,
    NotApplicable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingOutcome {
    pub predicate: String,
    #[serde(flatten)]
    pub result: BindingResult,
}

/// How one ACL entry's combined check went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryDecision {
    pub role: String,
    pub entry_id: i64,
    pub bindings: Vec<BindingOutcome>,
    pub verdict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionRecord {
    /// e.g. "delete", "read", "method", "arbitrary"
    pub operation: String,
    pub principal: String,
    /// Type name, "Manager.method" or permission name
    pub target: String,
    pub entries: Vec<EntryDecision>,
    pub allowed: bool,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &DecisionRecord);
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<DecisionRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.lock().clone()
    }

    pub fn last(&self) -> Option<DecisionRecord> {
        self.records.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &DecisionRecord) {
        self.records.lock().push(record.clone());
    }
}

pub(crate) fn emit(sink: Option<&dyn AuditSink>, record: DecisionRecord) {
    tracing::debug!(
        target: "gatekeeper::audit",
        operation = %record.operation,
        principal = %record.principal,
        target_name = %record.target,
        entries = record.entries.len(),
        allowed = record.allowed,
        "authorization decision"
    );
    for entry in &record.entries {
        tracing::trace!(
            target: "gatekeeper::audit",
            role = %entry.role,
            entry_id = entry.entry_id,
            verdict = entry.verdict,
            bindings = %serde_json::to_string(&entry.bindings).unwrap_or_default(),
            "entry evaluated"
        );
    }
    if let Some(sink) = sink {
        sink.record(&record);
    }
}
