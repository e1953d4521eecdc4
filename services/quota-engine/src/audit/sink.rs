use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::storage::{QuotaDatabase, StorageError};

use super::AuditFact;

pub trait AuditSink: Send + Sync {
    fn record(&self, fact: &AuditFact) -> Result<(), StorageError>;
}

/// Hands `fact` to the sink. A failing sink is logged and otherwise ignored:
/// auditing never changes a quota decision.
pub fn emit(sink: &dyn AuditSink, fact: AuditFact) {
    if let Err(err) = sink.record(&fact) {
        warn!(
            action = %fact.action,
            target_id = %fact.target_id,
            error = %err,
            "failed to record audit fact"
        );
    }
}

/// Writes each fact as a structured log line under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, fact: &AuditFact) -> Result<(), StorageError> {
        info!(
            target: "audit",
            actor = %fact.actor,
            action = %fact.action,
            target_type = %fact.target_type,
            target_id = %fact.target_id,
            payload = %fact.payload,
            "audit"
        );
        Ok(())
    }
}

pub struct DatabaseAuditSink {
    database: Arc<QuotaDatabase>,
}

impl DatabaseAuditSink {
    pub fn new(database: Arc<QuotaDatabase>) -> Self {
        Self { database }
    }
}

impl AuditSink for DatabaseAuditSink {
    fn record(&self, fact: &AuditFact) -> Result<(), StorageError> {
        self.database.write_audit_fact(fact)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSinkKind {
    Database,
    Log,
}

impl AuditSinkKind {
    pub fn build(&self, database: &Arc<QuotaDatabase>) -> Arc<dyn AuditSink> {
        match self {
            AuditSinkKind::Database => Arc::new(DatabaseAuditSink::new(Arc::clone(database))),
            AuditSinkKind::Log => Arc::new(TracingAuditSink),
        }
    }
}

impl FromStr for AuditSinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(AuditSinkKind::Database),
            "log" | "tracing" => Ok(AuditSinkKind::Log),
            other => Err(format!("unknown audit sink: {other}")),
        }
    }
}
