use super::proto;
use crate::domain::config_apply::ApplyOutcome;
use crate::domain::messages::{
    ApplyResult, Classification, CommandPayload, Envelope, EventReport, MessageId, MetricsReport,
    StreamError,
};
use crate::domain::transfer::{Frame, TransferMeta};
use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use thiserror::Error;
use tonic::{Code, Status};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("message has no metadata")]
    MissingMeta,
    #[error("message has no payload")]
    MissingData,
    #[error("invalid message id '{0}'")]
    InvalidMessageId(String),
    #[error("unknown apply outcome {0}")]
    UnknownOutcome(i32),
}

/// Splits gRPC failures into ones worth reconnecting over and ones the peer
/// meant.
pub fn classify_status(status: &Status) -> StreamError {
    match status.code() {
        Code::Unavailable
        | Code::Cancelled
        | Code::Unknown
        | Code::Internal
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted => StreamError::Transport(format!("{:?}: {}", status.code(), status.message())),
        code => StreamError::Application(format!("{code:?}: {}", status.message())),
    }
}

fn timestamp(at: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn from_timestamp(ts: Option<Timestamp>) -> DateTime<Utc> {
    ts.and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32))
        .unwrap_or_else(Utc::now)
}

fn metadata(id: MessageId, correlation_id: &str, at: DateTime<Utc>) -> proto::Metadata {
    proto::Metadata {
        message_id: id.to_string(),
        correlation_id: correlation_id.to_string(),
        timestamp: Some(timestamp(at)),
    }
}

fn envelope_metadata<P>(envelope: &Envelope<P>) -> proto::Metadata {
    metadata(envelope.id, &envelope.correlation_id, envelope.timestamp)
}

struct ParsedMeta {
    id: MessageId,
    correlation_id: String,
    timestamp: DateTime<Utc>,
}

fn parse_metadata(meta: Option<proto::Metadata>) -> Result<ParsedMeta, ConvertError> {
    let meta = meta.ok_or(ConvertError::MissingMeta)?;
    let id = MessageId::parse(&meta.message_id)
        .map_err(|_| ConvertError::InvalidMessageId(meta.message_id.clone()))?;
    let correlation_id = if meta.correlation_id.is_empty() {
        id.to_string()
    } else {
        meta.correlation_id
    };
    Ok(ParsedMeta {
        id,
        correlation_id,
        timestamp: from_timestamp(meta.timestamp),
    })
}

pub fn outcome_to_proto(outcome: ApplyOutcome) -> proto::ApplyOutcome {
    match outcome {
        ApplyOutcome::Applied => proto::ApplyOutcome::Applied,
        ApplyOutcome::NoChange => proto::ApplyOutcome::NoChange,
        ApplyOutcome::RolledBack => proto::ApplyOutcome::RolledBack,
        ApplyOutcome::RollbackFailed => proto::ApplyOutcome::RollbackFailed,
        ApplyOutcome::Rejected => proto::ApplyOutcome::Rejected,
    }
}

pub fn outcome_from_proto(raw: i32) -> Result<ApplyOutcome, ConvertError> {
    match proto::ApplyOutcome::try_from(raw) {
        Ok(proto::ApplyOutcome::Applied) => Ok(ApplyOutcome::Applied),
        Ok(proto::ApplyOutcome::NoChange) => Ok(ApplyOutcome::NoChange),
        Ok(proto::ApplyOutcome::RolledBack) => Ok(ApplyOutcome::RolledBack),
        Ok(proto::ApplyOutcome::RollbackFailed) => Ok(ApplyOutcome::RollbackFailed),
        Ok(proto::ApplyOutcome::Rejected) => Ok(ApplyOutcome::Rejected),
        Ok(proto::ApplyOutcome::Unspecified) | Err(_) => Err(ConvertError::UnknownOutcome(raw)),
    }
}

pub fn command_to_proto(envelope: &Envelope<CommandPayload>) -> proto::Command {
    use proto::command::Data;

    let data = match &envelope.payload {
        CommandPayload::ConfigApplyRequest { config_id } => {
            Data::ConfigApplyRequest(proto::ConfigApplyRequest {
                config_id: config_id.clone(),
            })
        }
        CommandPayload::ConfigApplyResponse(result) => {
            Data::ConfigApplyResponse(proto::ConfigApplyResponse {
                config_id: result.config_id.clone(),
                outcome: outcome_to_proto(result.outcome) as i32,
                message: result.message.clone(),
                error: result.error.clone().unwrap_or_default(),
            })
        }
        CommandPayload::ConfigUploadRequest { config_id } => {
            Data::ConfigUploadRequest(proto::ConfigUploadRequest {
                config_id: config_id.clone(),
            })
        }
        CommandPayload::Status { ok, message } => Data::Status(proto::CommandStatus {
            ok: *ok,
            message: message.clone(),
        }),
    };
    proto::Command {
        meta: Some(envelope_metadata(envelope)),
        data: Some(data),
    }
}

pub fn command_from_proto(command: proto::Command) -> Result<Envelope<CommandPayload>, ConvertError> {
    use proto::command::Data;

    let meta = parse_metadata(command.meta)?;
    let payload = match command.data.ok_or(ConvertError::MissingData)? {
        Data::ConfigApplyRequest(request) => CommandPayload::ConfigApplyRequest {
            config_id: request.config_id,
        },
        Data::ConfigApplyResponse(response) => CommandPayload::ConfigApplyResponse(ApplyResult {
            config_id: response.config_id,
            outcome: outcome_from_proto(response.outcome)?,
            message: response.message,
            error: Some(response.error).filter(|error| !error.is_empty()),
        }),
        Data::ConfigUploadRequest(request) => CommandPayload::ConfigUploadRequest {
            config_id: request.config_id,
        },
        Data::Status(status) => CommandPayload::Status {
            ok: status.ok,
            message: status.message,
        },
    };
    Ok(Envelope {
        id: meta.id,
        correlation_id: meta.correlation_id,
        timestamp: meta.timestamp,
        classification: Classification::Command,
        payload,
    })
}

pub fn metrics_to_proto(envelope: &Envelope<MetricsReport>) -> proto::MetricsReport {
    proto::MetricsReport {
        meta: Some(envelope_metadata(envelope)),
        samples: envelope
            .payload
            .samples
            .iter()
            .map(|sample| proto::MetricSample {
                name: sample.name.clone(),
                value: sample.value,
                attributes: sample
                    .attributes
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            })
            .collect(),
    }
}

pub fn event_to_proto(envelope: &Envelope<EventReport>) -> proto::EventReport {
    proto::EventReport {
        meta: Some(envelope_metadata(envelope)),
        kind: envelope.payload.kind.clone(),
        payload_json: envelope.payload.payload.to_string(),
    }
}

fn transfer_metadata(meta: &TransferMeta) -> proto::Metadata {
    metadata(meta.message_id, &meta.correlation_id, meta.timestamp)
}

fn parse_transfer_metadata(meta: Option<proto::Metadata>) -> Result<TransferMeta, ConvertError> {
    let meta = parse_metadata(meta)?;
    Ok(TransferMeta {
        message_id: meta.id,
        correlation_id: meta.correlation_id,
        timestamp: meta.timestamp,
    })
}

pub fn download_request(config_id: &str, meta: &TransferMeta) -> proto::DownloadRequest {
    proto::DownloadRequest {
        meta: Some(transfer_metadata(meta)),
        config_id: config_id.to_string(),
    }
}

pub fn frame_to_proto(frame: Frame) -> proto::DataChunk {
    use proto::data_chunk::Chunk;

    let chunk = match frame {
        Frame::Header {
            total_chunks,
            checksum,
            frame_size,
            meta,
        } => Chunk::Header(proto::ChunkHeader {
            total_chunks,
            checksum,
            frame_size,
            meta: Some(transfer_metadata(&meta)),
        }),
        Frame::Data {
            chunk_index,
            bytes,
            meta,
        } => Chunk::Data(proto::ChunkData {
            chunk_index,
            data: bytes,
            meta: Some(transfer_metadata(&meta)),
        }),
    };
    proto::DataChunk { chunk: Some(chunk) }
}

pub fn frame_from_proto(chunk: proto::DataChunk) -> Result<Frame, ConvertError> {
    use proto::data_chunk::Chunk;

    match chunk.chunk.ok_or(ConvertError::MissingData)? {
        Chunk::Header(header) => Ok(Frame::Header {
            total_chunks: header.total_chunks,
            checksum: header.checksum,
            frame_size: header.frame_size,
            meta: parse_transfer_metadata(header.meta)?,
        }),
        Chunk::Data(data) => Ok(Frame::Data {
            chunk_index: data.chunk_index,
            bytes: data.data,
            meta: parse_transfer_metadata(data.meta)?,
        }),
    }
}
