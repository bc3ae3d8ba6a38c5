use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Lifecycle of a configuration apply as published on the event bus.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum ApplyEvent {
    #[serde(rename = "apply.pending")]
    Pending { config_id: String },
    #[serde(rename = "apply.succeeded")]
    Succeeded {
        config_id: String,
        written: usize,
        purged: Vec<PathBuf>,
    },
    #[serde(rename = "apply.no_change")]
    NoChange { config_id: String },
    #[serde(rename = "apply.rolled_back")]
    RolledBack { config_id: String, reason: String },
    #[serde(rename = "apply.rollback_failed")]
    RollbackFailed {
        config_id: String,
        reason: String,
        failures: Vec<String>,
    },
    #[serde(rename = "apply.rejected")]
    Rejected { config_id: String, reason: String },
}

impl ApplyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ApplyEvent::Pending { .. } => "apply.pending",
            ApplyEvent::Succeeded { .. } => "apply.succeeded",
            ApplyEvent::NoChange { .. } => "apply.no_change",
            ApplyEvent::RolledBack { .. } => "apply.rolled_back",
            ApplyEvent::RollbackFailed { .. } => "apply.rollback_failed",
            ApplyEvent::Rejected { .. } => "apply.rejected",
        }
    }

    pub fn config_id(&self) -> &str {
        match self {
            ApplyEvent::Pending { config_id }
            | ApplyEvent::Succeeded { config_id, .. }
            | ApplyEvent::NoChange { config_id }
            | ApplyEvent::RolledBack { config_id, .. }
            | ApplyEvent::RollbackFailed { config_id, .. }
            | ApplyEvent::Rejected { config_id, .. } => config_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApplyEventEnvelope {
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
    pub event: ApplyEvent,
}

impl ApplyEventEnvelope {
    pub fn new(correlation_id: impl Into<String>, event: ApplyEvent) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        let mut payload = serde_json::to_value(&self.event).unwrap_or_default();
        if let Some(map) = payload.as_object_mut() {
            map.insert(
                "correlation_id".into(),
                serde_json::Value::String(self.correlation_id.clone()),
            );
            map.insert(
                "occurred_at".into(),
                serde_json::Value::String(self.occurred_at.to_rfc3339()),
            );
        }
        payload
    }
}
