use crate::backoff::{wait_until, BackoffError, BackoffSettings, Retry};
use crate::domain::messages::StreamError;
use crate::domain::transfer::{encode_frames, Frame, FrameAssembler, TransferError, TransferMeta};
use crate::ports::transfer::TransferPort;
use crate::telemetry::AgentMetrics;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sends `payload` as one chunked upload and waits for the acknowledgement.
pub async fn upload<P>(
    port: &P,
    payload: &[u8],
    frame_size: usize,
    meta: &TransferMeta,
) -> Result<(), TransferError>
where
    P: TransferPort + ?Sized,
{
    let frames = encode_frames(payload, frame_size, meta)?;
    debug!(
        frames = frames.len(),
        bytes = payload.len(),
        correlation_id = %meta.correlation_id,
        "uploading chunked payload"
    );
    let ack = port.upload(frames).await?;
    if ack.ok {
        Ok(())
    } else {
        Err(TransferError::Rejected(ack.reason))
    }
}

/// Downloads one chunked payload, verifies it and decodes it as JSON.
/// Returns the value together with the verified payload size.
pub async fn download_into<P, T>(
    port: &P,
    config_id: &str,
    meta: TransferMeta,
) -> Result<(T, usize), TransferError>
where
    P: TransferPort + ?Sized,
    T: DeserializeOwned,
{
    let mut frames = port.download(config_id, meta).await?;
    let mut assembler = FrameAssembler::new();
    let mut bytes = 0usize;
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        if let Frame::Data { bytes: data, .. } = &frame {
            bytes += data.len();
        }
        assembler.push(frame)?;
    }
    let value = assembler.finish_into()?;
    Ok((value, bytes))
}

/// Runs whole transfers under backoff. Only transport failures restart a
/// transfer; framing, integrity and rejection errors are final.
pub struct TransferClient<P> {
    port: P,
    frame_size: usize,
    settings: BackoffSettings,
    cancel: CancellationToken,
    metrics: Option<Arc<AgentMetrics>>,
}

impl<P: TransferPort> TransferClient<P> {
    pub fn new(
        port: P,
        frame_size: usize,
        settings: BackoffSettings,
        cancel: &CancellationToken,
        metrics: Option<Arc<AgentMetrics>>,
    ) -> Result<Self, TransferError> {
        if frame_size == 0 {
            return Err(TransferError::InvalidFrameSize);
        }
        Ok(Self {
            port,
            frame_size,
            settings,
            cancel: cancel.child_token(),
            metrics,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub async fn download<T: DeserializeOwned>(
        &self,
        config_id: &str,
        correlation_id: &str,
    ) -> Result<T, TransferError> {
        let (value, bytes) = self
            .retrying("download", || {
                download_into(&self.port, config_id, TransferMeta::new(correlation_id))
            })
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_transfer("download", bytes);
        }
        Ok(value)
    }

    pub async fn upload<T: Serialize>(
        &self,
        value: &T,
        correlation_id: &str,
    ) -> Result<(), TransferError> {
        let payload = serde_json::to_vec(value).map_err(TransferError::Marshal)?;
        let meta = TransferMeta::new(correlation_id);
        self.retrying("upload", || {
            upload(&self.port, &payload, self.frame_size, &meta)
        })
        .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_transfer("upload", payload.len());
        }
        Ok(())
    }

    async fn retrying<T, F, Fut>(&self, direction: &str, mut attempt: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        wait_until(&self.cancel, &self.settings, || {
            let transfer = attempt();
            async move {
                transfer.await.map_err(|err| {
                    if err.is_retryable() {
                        warn!(%direction, %err, "transfer interrupted, restarting");
                        Retry::Transient(err)
                    } else {
                        Retry::Permanent(err)
                    }
                })
            }
        })
        .await
        .map_err(|err| match err {
            BackoffError::Cancelled => TransferError::Transport(StreamError::Closed),
            BackoffError::Exhausted {
                attempts,
                last: TransferError::Transport(last),
                ..
            } => TransferError::Transport(StreamError::Exhausted {
                attempts,
                last: Box::new(last),
            }),
            BackoffError::Exhausted { last, .. } => last,
            BackoffError::Permanent(err) => err,
        })
    }
}
