mod sink;

use serde::{Deserialize, Serialize};

pub use sink::{emit, AuditSink, AuditSinkKind, DatabaseAuditSink, TracingAuditSink};

pub const CONSUME_QUOTA: &str = "CONSUME_QUOTA";
pub const REJECT_QUOTA: &str = "REJECT_QUOTA";
pub const BATCH_CONSUME_QUOTA: &str = "BATCH_CONSUME_QUOTA";
pub const BATCH_REJECT_QUOTA: &str = "BATCH_REJECT_QUOTA";
pub const RECORD_USAGE: &str = "RECORD_USAGE";
pub const PROCESS_QUOTA_CARRY_OVER: &str = "PROCESS_QUOTA_CARRY_OVER";
pub const CREATE_QUOTA_PLAN: &str = "CREATE_QUOTA_PLAN";
pub const UPDATE_QUOTA_PLAN: &str = "UPDATE_QUOTA_PLAN";
pub const DELETE_QUOTA_PLAN: &str = "DELETE_QUOTA_PLAN";
pub const BIND_QUOTA_PLAN: &str = "BIND_QUOTA_PLAN";

/// Structured record of something the engine did, for an external audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFact {
    pub actor: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub payload: serde_json::Value,
}

impl AuditFact {
    pub fn new(actor: &str, action: &str, target_type: &str, target_id: &str) -> Self {
        Self {
            actor: actor.to_string(),
            action: action.to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
