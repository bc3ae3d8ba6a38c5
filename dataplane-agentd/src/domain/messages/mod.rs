pub mod envelope;
pub mod error;
pub mod payload;

pub use envelope::{Classification, Classified, Envelope, MessageId};
pub use error::StreamError;
pub use payload::{ApplyResult, CommandPayload, EventReport, MetricSample, MetricsReport};
