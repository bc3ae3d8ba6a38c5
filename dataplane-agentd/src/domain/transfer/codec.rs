use super::frame::{Frame, TransferMeta};
use crate::domain::messages::StreamError;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

pub const DEFAULT_FRAME_SIZE: usize = 4096;

// Upper bound for up-front buffer reservation; the header is untrusted input.
const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("frame size must be greater than zero")]
    InvalidFrameSize,
    #[error("payload of {len} bytes does not fit into {frame_size}-byte frames")]
    PayloadTooLarge { len: usize, frame_size: usize },
    #[error("expected exactly one header frame, saw {0}")]
    UnexpectedHeaderCount(usize),
    #[error("data frame out of order: expected index {expected}, got {actual}")]
    OutOfOrder { expected: u32, actual: u32 },
    #[error("expected {expected} data frames, received {actual}")]
    ChunkCountMismatch { expected: u32, actual: u32 },
    #[error("checksum mismatch: header announced {expected}, payload hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("failed to decode transferred payload: {0}")]
    Unmarshal(#[source] serde_json::Error),
    #[error("failed to encode payload for transfer: {0}")]
    Marshal(#[source] serde_json::Error),
    #[error("upload rejected by management plane: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] StreamError),
}

impl TransferError {
    /// Only transport failures justify restarting a transfer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transport(err) if err.is_transport())
    }
}

/// Lowercase hex SHA-256 of `payload`.
pub fn checksum(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Splits `payload` into a header frame plus `ceil(len / frame_size)` data
/// frames.
pub fn encode_frames(
    payload: &[u8],
    frame_size: usize,
    meta: &TransferMeta,
) -> Result<Vec<Frame>, TransferError> {
    if frame_size == 0 {
        return Err(TransferError::InvalidFrameSize);
    }
    let too_large = || TransferError::PayloadTooLarge {
        len: payload.len(),
        frame_size,
    };
    let total_chunks = u32::try_from(payload.len().div_ceil(frame_size)).map_err(|_| too_large())?;
    let announced_size = u32::try_from(frame_size).map_err(|_| too_large())?;

    let mut frames = Vec::with_capacity(total_chunks as usize + 1);
    frames.push(Frame::Header {
        total_chunks,
        checksum: checksum(payload),
        frame_size: announced_size,
        meta: meta.clone(),
    });
    frames.extend(
        payload
            .chunks(frame_size)
            .enumerate()
            .map(|(index, slice)| Frame::Data {
                chunk_index: index as u32,
                bytes: slice.to_vec(),
                meta: meta.clone(),
            }),
    );
    Ok(frames)
}

struct Announced {
    total_chunks: u32,
    checksum: String,
}

/// Reassembles a received frame sequence, enforcing framing rules as frames
/// arrive and verifying integrity once the stream ends.
#[derive(Default)]
pub struct FrameAssembler {
    header: Option<Announced>,
    headers_seen: usize,
    received: u32,
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received_chunks(&self) -> u32 {
        self.received
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), TransferError> {
        match frame {
            Frame::Header {
                total_chunks,
                checksum,
                frame_size,
                ..
            } => {
                self.headers_seen += 1;
                if self.headers_seen > 1 {
                    return Err(TransferError::UnexpectedHeaderCount(self.headers_seen));
                }
                let expected_len = (total_chunks as usize).saturating_mul(frame_size as usize);
                self.buffer.reserve(expected_len.min(MAX_PREALLOCATION));
                self.header = Some(Announced {
                    total_chunks,
                    checksum,
                });
                Ok(())
            }
            Frame::Data {
                chunk_index, bytes, ..
            } => {
                let Some(header) = &self.header else {
                    return Err(TransferError::UnexpectedHeaderCount(0));
                };
                if chunk_index != self.received {
                    return Err(TransferError::OutOfOrder {
                        expected: self.received,
                        actual: chunk_index,
                    });
                }
                if self.received >= header.total_chunks {
                    return Err(TransferError::ChunkCountMismatch {
                        expected: header.total_chunks,
                        actual: self.received.saturating_add(1),
                    });
                }
                self.buffer.extend_from_slice(&bytes);
                self.received += 1;
                Ok(())
            }
        }
    }

    /// Consumes the assembler after end of stream and returns the verified
    /// payload bytes.
    pub fn finish(self) -> Result<Vec<u8>, TransferError> {
        let header = self
            .header
            .ok_or(TransferError::UnexpectedHeaderCount(self.headers_seen))?;
        if self.received != header.total_chunks {
            return Err(TransferError::ChunkCountMismatch {
                expected: header.total_chunks,
                actual: self.received,
            });
        }
        let actual = checksum(&self.buffer);
        if actual != header.checksum {
            return Err(TransferError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        Ok(self.buffer)
    }

    pub fn finish_into<T: DeserializeOwned>(self) -> Result<T, TransferError> {
        let bytes = self.finish()?;
        serde_json::from_slice(&bytes).map_err(TransferError::Unmarshal)
    }
}
