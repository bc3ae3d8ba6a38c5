use super::payload::{CommandPayload, EventReport, MetricsReport};
use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Unique identifier assigned by the producer of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(value).map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        MessageId::parse(&value).map_err(D::Error::custom)
    }
}

/// Channel a message belongs to. Each stream client carries exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Command,
    Metric,
    Event,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Command => "command",
            Classification::Metric => "metric",
            Classification::Event => "event",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that knows which channel it belongs on.
pub trait Classified {
    fn classification(&self) -> Classification;
}

/// Immutable message wrapper shared by every channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<P> {
    pub id: MessageId,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub classification: Classification,
    pub payload: P,
}

impl<P> Envelope<P> {
    /// Creates a message that starts its own correlation chain.
    pub fn new(classification: Classification, payload: P) -> Self {
        let id = MessageId::new();
        Self {
            id,
            correlation_id: id.to_string(),
            timestamp: Utc::now(),
            classification,
            payload,
        }
    }

    /// Creates a message answering or continuing `correlation_id`.
    pub fn correlated(
        classification: Classification,
        correlation_id: impl Into<String>,
        payload: P,
    ) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            classification,
            payload,
        }
    }
}

impl<P> Classified for Envelope<P> {
    fn classification(&self) -> Classification {
        self.classification
    }
}

impl Envelope<CommandPayload> {
    pub fn command(payload: CommandPayload) -> Self {
        Self::new(Classification::Command, payload)
    }

    pub fn reply_to(request: &Envelope<CommandPayload>, payload: CommandPayload) -> Self {
        Self::correlated(Classification::Command, request.correlation_id.clone(), payload)
    }
}

impl Envelope<MetricsReport> {
    pub fn metric(report: MetricsReport) -> Self {
        Self::new(Classification::Metric, report)
    }
}

impl Envelope<EventReport> {
    pub fn event(report: EventReport) -> Self {
        Self::new(Classification::Event, report)
    }
}
