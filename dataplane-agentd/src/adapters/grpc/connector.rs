use super::convert::{classify_status, command_from_proto, command_to_proto, event_to_proto, metrics_to_proto};
use super::proto::command_service_client::CommandServiceClient;
use super::proto::metrics_service_client::MetricsServiceClient;
use super::proto;
use crate::domain::messages::{
    Classification, CommandPayload, Envelope, EventReport, MetricsReport, StreamError,
};
use crate::ports::stream::{StreamConnector, StreamSession, StreamSink};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Status;
use tracing::{debug, warn};

const OUTBOUND_BUFFER: usize = 32;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Address of the management plane plus optional client TLS.
#[derive(Clone, Debug)]
pub struct ManagementEndpoint {
    uri: String,
    tls: Option<ClientTlsConfig>,
}

impl ManagementEndpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Dials a fresh HTTP/2 connection.
    pub async fn connect(&self) -> Result<Channel, StreamError> {
        let mut endpoint = Endpoint::from_shared(self.uri.clone())
            .map_err(|err| StreamError::InvalidEndpoint(format!("{}: {err}", self.uri)))?
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|err| StreamError::InvalidEndpoint(format!("{}: {err}", self.uri)))?;
        }
        endpoint
            .connect()
            .await
            .map_err(|err| StreamError::Transport(format!("connecting to {}: {err}", self.uri)))
    }
}

type CallHandle = JoinHandle<Result<(), Status>>;

/// Send half backed by the request stream of one gRPC call. Client-streaming
/// calls also keep the call task so its final status can be reported.
struct ChannelSink<T, M> {
    tx: Mutex<Option<mpsc::Sender<M>>>,
    call: Mutex<Option<CallHandle>>,
    encode: fn(&T) -> M,
    target: String,
}

impl<T, M> ChannelSink<T, M> {
    fn new(tx: mpsc::Sender<M>, call: Option<CallHandle>, encode: fn(&T) -> M, target: &str) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            call: Mutex::new(call),
            encode,
            target: target.to_string(),
        }
    }

    async fn terminal_error(&self) -> StreamError {
        let Some(call) = self.call.lock().await.take() else {
            return StreamError::Transport(format!("{} stream closed by peer", self.target));
        };
        match settle(call).await {
            Some(Ok(Err(status))) => classify_status(&status),
            Some(Ok(Ok(()))) => {
                StreamError::Transport(format!("{} stream completed by peer", self.target))
            }
            Some(Err(err)) => {
                StreamError::Transport(format!("{} call task failed: {err}", self.target))
            }
            None => StreamError::Transport(format!("{} call did not finish", self.target)),
        }
    }
}

/// Waits up to `CLOSE_GRACE` for the call to finish. A call that does not is
/// aborted, which drops its channel and with it the connection.
async fn settle(mut call: CallHandle) -> Option<Result<Result<(), Status>, JoinError>> {
    tokio::select! {
        joined = &mut call => Some(joined),
        _ = sleep(CLOSE_GRACE) => {
            call.abort();
            None
        }
    }
}

#[async_trait]
impl<T, M> StreamSink<T> for ChannelSink<T, M>
where
    T: Send + Sync + 'static,
    M: Send + 'static,
{
    async fn send(&self, message: T) -> Result<(), StreamError> {
        let tx = self.tx.lock().await.clone();
        let Some(tx) = tx else {
            return Err(StreamError::Transport(format!(
                "{} stream already closed",
                self.target
            )));
        };
        if tx.send((self.encode)(&message)).await.is_ok() {
            return Ok(());
        }
        Err(self.terminal_error().await)
    }

    async fn close(&self) {
        self.tx.lock().await.take();
        let call = self.call.lock().await.take();
        if let Some(call) = call {
            match settle(call).await {
                Some(Ok(Ok(()))) => debug!(target = %self.target, "stream finished"),
                Some(Ok(Err(status))) => {
                    debug!(target = %self.target, code = ?status.code(), "stream ended with status")
                }
                Some(Err(err)) if err.is_cancelled() => {}
                Some(Err(err)) => warn!(target = %self.target, %err, "stream task failed"),
                None => debug!(target = %self.target, "stream did not finish in time, aborted"),
            }
        }
    }
}

/// Opens the bidirectional command channel.
pub struct CommandConnector {
    endpoint: ManagementEndpoint,
    target: String,
}

impl CommandConnector {
    pub fn new(endpoint: ManagementEndpoint) -> Self {
        let target = format!("{}#command", endpoint.uri());
        Self { endpoint, target }
    }
}

#[async_trait]
impl StreamConnector for CommandConnector {
    type Outbound = Envelope<CommandPayload>;
    type Inbound = Envelope<CommandPayload>;

    fn classification(&self) -> Classification {
        Classification::Command
    }

    fn has_inbound(&self) -> bool {
        true
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn open(&self) -> Result<StreamSession<Self::Outbound, Self::Inbound>, StreamError> {
        let mut client = CommandServiceClient::new(self.endpoint.connect().await?);
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let response = client
            .command_channel(ReceiverStream::new(rx))
            .await
            .map_err(|status| classify_status(&status))?;

        let target = self.target.clone();
        let inbound = response
            .into_inner()
            .filter_map(move |item| {
                let item = match item {
                    Ok(command) => match command_from_proto(command) {
                        Ok(envelope) => Some(Ok(envelope)),
                        Err(err) => {
                            warn!(%target, %err, "dropping malformed command");
                            None
                        }
                    },
                    Err(status) => Some(Err(classify_status(&status))),
                };
                futures::future::ready(item)
            })
            .boxed();

        Ok(StreamSession {
            sink: Box::new(ChannelSink::new(tx, None, command_to_proto, &self.target)),
            inbound: Some(inbound),
        })
    }
}

/// Opens the client-streaming metrics call.
pub struct MetricsConnector {
    endpoint: ManagementEndpoint,
    target: String,
}

impl MetricsConnector {
    pub fn new(endpoint: ManagementEndpoint) -> Self {
        let target = format!("{}#metrics", endpoint.uri());
        Self { endpoint, target }
    }
}

#[async_trait]
impl StreamConnector for MetricsConnector {
    type Outbound = Envelope<MetricsReport>;
    type Inbound = ();

    fn classification(&self) -> Classification {
        Classification::Metric
    }

    fn has_inbound(&self) -> bool {
        false
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn open(&self) -> Result<StreamSession<Self::Outbound, Self::Inbound>, StreamError> {
        let mut client = MetricsServiceClient::new(self.endpoint.connect().await?);
        let (tx, rx) = mpsc::channel::<proto::MetricsReport>(OUTBOUND_BUFFER);
        let call = tokio::spawn(async move {
            client.stream(ReceiverStream::new(rx)).await.map(|_| ())
        });
        Ok(StreamSession {
            sink: Box::new(ChannelSink::new(tx, Some(call), metrics_to_proto, &self.target)),
            inbound: None,
        })
    }
}

/// Opens the client-streaming event call.
pub struct EventsConnector {
    endpoint: ManagementEndpoint,
    target: String,
}

impl EventsConnector {
    pub fn new(endpoint: ManagementEndpoint) -> Self {
        let target = format!("{}#events", endpoint.uri());
        Self { endpoint, target }
    }
}

#[async_trait]
impl StreamConnector for EventsConnector {
    type Outbound = Envelope<EventReport>;
    type Inbound = ();

    fn classification(&self) -> Classification {
        Classification::Event
    }

    fn has_inbound(&self) -> bool {
        false
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn open(&self) -> Result<StreamSession<Self::Outbound, Self::Inbound>, StreamError> {
        let mut client = MetricsServiceClient::new(self.endpoint.connect().await?);
        let (tx, rx) = mpsc::channel::<proto::EventReport>(OUTBOUND_BUFFER);
        let call = tokio::spawn(async move {
            client.stream_events(ReceiverStream::new(rx)).await.map(|_| ())
        });
        Ok(StreamSession {
            sink: Box::new(ChannelSink::new(tx, Some(call), event_to_proto, &self.target)),
            inbound: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_uri_is_invalid_endpoint() {
        let err = ManagementEndpoint::new("not a uri").connect().await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidEndpoint(_)), "{err:?}");
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn refused_connection_is_transport() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = CommandConnector::new(ManagementEndpoint::new(format!("http://{addr}")));
        let err = connector.open().await.err().unwrap();
        assert!(err.is_transport(), "{err:?}");
        assert_eq!(connector.target(), format!("http://{addr}#command"));
    }

    #[tokio::test]
    async fn sink_reports_peer_status_after_call_ends() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let call: CallHandle =
            tokio::spawn(async { Err(Status::permission_denied("agent not enrolled")) });
        let sink: ChannelSink<u32, u32> = ChannelSink::new(tx, Some(call), |value| *value, "test");
        let err = sink.send(7).await.unwrap_err();
        assert!(matches!(err, StreamError::Application(ref msg) if msg.contains("not enrolled")));

        sink.close().await;
        assert!(sink.send(8).await.unwrap_err().is_transport());
    }

    fn hung_call(held: &std::sync::Arc<()>) -> CallHandle {
        let held = std::sync::Arc::clone(held);
        tokio::spawn(async move {
            let _held = held;
            std::future::pending::<Result<(), Status>>().await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn close_aborts_a_call_that_never_finishes() {
        let held = std::sync::Arc::new(());
        let (tx, _rx) = mpsc::channel::<u32>(1);
        let sink: ChannelSink<u32, u32> =
            ChannelSink::new(tx, Some(hung_call(&held)), |value| *value, "test");

        sink.close().await;
        drop(sink);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(std::sync::Arc::strong_count(&held), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_aborts_a_hung_call() {
        let held = std::sync::Arc::new(());
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let sink: ChannelSink<u32, u32> =
            ChannelSink::new(tx, Some(hung_call(&held)), |value| *value, "test");

        let err = sink.send(1).await.unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(std::sync::Arc::strong_count(&held), 1);
    }
}
