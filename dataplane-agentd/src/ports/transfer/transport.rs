use crate::domain::messages::StreamError;
use crate::domain::transfer::{Frame, TransferMeta};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub type FrameStream = BoxStream<'static, Result<Frame, StreamError>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadAck {
    pub ok: bool,
    pub reason: String,
}

/// Raw frame transport for chunked bundle transfers.
#[async_trait]
pub trait TransferPort: Send + Sync {
    async fn download(&self, config_id: &str, meta: TransferMeta)
        -> Result<FrameStream, StreamError>;

    async fn upload(&self, frames: Vec<Frame>) -> Result<UploadAck, StreamError>;
}
