use crate::domain::messages::MessageId;
use chrono::{DateTime, Utc};

/// Metadata stamped on every frame of one transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferMeta {
    pub message_id: MessageId,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl TransferMeta {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One unit of a chunked transfer. A complete transfer is a single `Header`
/// followed by `total_chunks` `Data` frames in index order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Header {
        total_chunks: u32,
        checksum: String,
        frame_size: u32,
        meta: TransferMeta,
    },
    Data {
        chunk_index: u32,
        bytes: Vec<u8>,
        meta: TransferMeta,
    },
}

impl Frame {
    pub fn meta(&self) -> &TransferMeta {
        match self {
            Frame::Header { meta, .. } | Frame::Data { meta, .. } => meta,
        }
    }

    pub fn is_header(&self) -> bool {
        matches!(self, Frame::Header { .. })
    }
}
