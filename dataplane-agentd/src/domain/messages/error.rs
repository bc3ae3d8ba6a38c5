use super::envelope::Classification;
use crate::backoff::{BackoffError, Retry};

/// Failure observed on a management-plane stream.
///
/// Only `Transport` is worth a reconnect; the remaining kinds are surfaced to
/// the caller as-is.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("application error: {0}")]
    Application(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("{actual} message cannot be sent on the {expected} channel")]
    ClassificationMismatch {
        expected: Classification,
        actual: Classification,
    },
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: Box<StreamError> },
    #[error("stream client is closed")]
    Closed,
}

impl StreamError {
    /// Folds a backoff failure back into the stream error space.
    pub fn from_backoff(err: BackoffError<StreamError>) -> Self {
        match err {
            BackoffError::Cancelled => StreamError::Closed,
            BackoffError::Exhausted { attempts, last, .. } => StreamError::Exhausted {
                attempts,
                last: Box::new(last),
            },
            BackoffError::Permanent(err) => err,
        }
    }

    /// Retry classification used by every backoff loop around a stream.
    pub fn into_retry(self) -> Retry<StreamError> {
        if self.is_terminal()
            || matches!(
                self,
                StreamError::Application(_) | StreamError::ClassificationMismatch { .. }
            )
        {
            Retry::Permanent(self)
        } else {
            Retry::Transient(self)
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, StreamError::Transport(_))
    }

    /// Errors that no amount of reconnecting can fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamError::InvalidEndpoint(_) | StreamError::Closed
        )
    }
}
