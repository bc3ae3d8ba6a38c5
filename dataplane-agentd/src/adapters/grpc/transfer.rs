use super::connector::ManagementEndpoint;
use super::convert::{classify_status, download_request, frame_from_proto, frame_to_proto};
use super::proto;
use super::proto::command_service_client::CommandServiceClient;
use crate::domain::messages::StreamError;
use crate::domain::transfer::{Frame, TransferMeta};
use crate::ports::transfer::{FrameStream, TransferPort, UploadAck};
use async_trait::async_trait;
use futures::StreamExt;

/// Chunked bundle transfers over `CommandService.Download` and `Upload`.
pub struct GrpcTransfer {
    endpoint: ManagementEndpoint,
}

impl GrpcTransfer {
    pub fn new(endpoint: ManagementEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl TransferPort for GrpcTransfer {
    async fn download(
        &self,
        config_id: &str,
        meta: TransferMeta,
    ) -> Result<FrameStream, StreamError> {
        let mut client = CommandServiceClient::new(self.endpoint.connect().await?);
        let response = client
            .download(download_request(config_id, &meta))
            .await
            .map_err(|status| classify_status(&status))?;
        Ok(response
            .into_inner()
            .map(|item| match item {
                Ok(chunk) => frame_from_proto(chunk)
                    .map_err(|err| StreamError::Application(format!("malformed chunk: {err}"))),
                Err(status) => Err(classify_status(&status)),
            })
            .boxed())
    }

    async fn upload(&self, frames: Vec<Frame>) -> Result<UploadAck, StreamError> {
        let mut client = CommandServiceClient::new(self.endpoint.connect().await?);
        let chunks = futures::stream::iter(frames.into_iter().map(frame_to_proto));
        let status = client
            .upload(chunks)
            .await
            .map_err(|status| classify_status(&status))?
            .into_inner();
        Ok(UploadAck {
            ok: status.status == proto::UploadStatusCode::Ok as i32,
            reason: status.reason,
        })
    }
}
