use crate::domain::config_apply::ApplyOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Commands exchanged over the bidirectional command channel.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandPayload {
    ConfigApplyRequest { config_id: String },
    ConfigApplyResponse(ApplyResult),
    ConfigUploadRequest { config_id: String },
    Status { ok: bool, message: String },
}

impl CommandPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandPayload::ConfigApplyRequest { .. } => "config_apply_request",
            CommandPayload::ConfigApplyResponse(_) => "config_apply_response",
            CommandPayload::ConfigUploadRequest { .. } => "config_upload_request",
            CommandPayload::Status { .. } => "status",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub config_id: String,
    pub outcome: ApplyOutcome,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub samples: Vec<MetricSample>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub kind: String,
    pub payload: Value,
}
