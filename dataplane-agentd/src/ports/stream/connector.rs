use crate::domain::messages::{Classification, StreamError};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub type InboundStream<T> = BoxStream<'static, Result<T, StreamError>>;

/// Send half of one open stream.
#[async_trait]
pub trait StreamSink<T>: Send + Sync {
    async fn send(&self, message: T) -> Result<(), StreamError>;

    /// Closes the send half and waits for the peer to finish the call.
    async fn close(&self);
}

/// A freshly opened stream. Client-streaming calls have no inbound half.
pub struct StreamSession<O, I> {
    pub sink: Box<dyn StreamSink<O>>,
    pub inbound: Option<InboundStream<I>>,
}

/// Opens one kind of management-plane stream.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    type Outbound: Send + 'static;
    type Inbound: Send + 'static;

    fn classification(&self) -> Classification;

    /// Whether opened sessions carry an inbound half worth receiving from.
    fn has_inbound(&self) -> bool;

    /// Human readable target used in logs.
    fn target(&self) -> &str;

    async fn open(&self) -> Result<StreamSession<Self::Outbound, Self::Inbound>, StreamError>;
}
