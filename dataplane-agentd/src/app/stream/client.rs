use crate::backoff::{wait_until, BackoffSettings, Retry};
use crate::domain::messages::{Classification, Classified, StreamError};
use crate::ports::stream::{InboundStream, StreamConnector, StreamSession, StreamSink};
use crate::telemetry::AgentMetrics;
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

// Pause between receive-loop reconnect rounds that failed outright.
const RECONNECT_PAUSE_FLOOR: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
}

struct Connection<O, I> {
    generation: u64,
    sink: Option<Arc<dyn StreamSink<O>>>,
    inbound: Option<InboundStream<I>>,
    session_token: CancellationToken,
    closed: bool,
}

/// How a reconnect opens the replacement session. Sends already run inside a
/// backoff loop, so they open once per attempt.
#[derive(Clone, Copy, Debug)]
enum OpenPolicy {
    Backoff,
    Single,
}

enum Active<O> {
    Ready(u64, Arc<dyn StreamSink<O>>),
    Idle(u64),
}

struct Shared<C: StreamConnector> {
    connector: C,
    settings: BackoffSettings,
    connection: Mutex<Connection<C::Outbound, C::Inbound>>,
    state: watch::Sender<ClientState>,
    cancel: CancellationToken,
    reconnects: AtomicU64,
    metrics: Option<Arc<AgentMetrics>>,
}

impl<C: StreamConnector> Shared<C> {
    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    async fn open_with_backoff(
        &self,
    ) -> Result<StreamSession<C::Outbound, C::Inbound>, StreamError> {
        wait_until(&self.cancel, &self.settings, || async {
            self.connector.open().await.map_err(|err| {
                debug!(target = self.connector.target(), %err, "stream open failed");
                err.into_retry()
            })
        })
        .await
        .map_err(StreamError::from_backoff)
    }

    /// Replaces the session of generation `observed`. Returns `Ok(false)` when
    /// that session was already replaced by someone else.
    async fn reconnect(
        &self,
        observed: u64,
        pending: ClientState,
        open: OpenPolicy,
    ) -> Result<bool, StreamError> {
        let mut conn = self.connection.lock().await;
        if conn.closed {
            return Err(StreamError::Closed);
        }
        if conn.generation != observed {
            debug!(
                target = self.connector.target(),
                observed,
                current = conn.generation,
                "ignoring failure of a replaced session"
            );
            return Ok(false);
        }

        self.set_state(pending);
        conn.session_token.cancel();
        conn.inbound = None;
        if let Some(previous) = conn.sink.take() {
            previous.close().await;
        }

        let opened = match open {
            OpenPolicy::Backoff => self.open_with_backoff().await,
            OpenPolicy::Single => self.connector.open().await,
        };
        match opened {
            Ok(session) => {
                conn.generation += 1;
                conn.sink = Some(Arc::from(session.sink));
                conn.inbound = session.inbound;
                conn.session_token = CancellationToken::new();
                self.set_state(ClientState::Streaming);
                if conn.generation > 1 {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_reconnect(self.connector.classification().as_str());
                    }
                }
                info!(
                    target = self.connector.target(),
                    channel = %self.connector.classification(),
                    generation = conn.generation,
                    "stream established"
                );
                Ok(true)
            }
            Err(err) => {
                self.set_state(ClientState::Disconnected);
                Err(err)
            }
        }
    }

    async fn active(&self) -> Result<Active<C::Outbound>, StreamError> {
        let conn = self.connection.lock().await;
        if conn.closed {
            return Err(StreamError::Closed);
        }
        Ok(match &conn.sink {
            Some(sink) => Active::Ready(conn.generation, Arc::clone(sink)),
            None => Active::Idle(conn.generation),
        })
    }

    async fn take_inbound(
        &self,
    ) -> Result<(u64, InboundStream<C::Inbound>, CancellationToken), u64> {
        let mut conn = self.connection.lock().await;
        let generation = conn.generation;
        match conn.inbound.take() {
            Some(inbound) => Ok((generation, inbound, conn.session_token.clone())),
            None => Err(generation),
        }
    }

    async fn send_once(&self, message: C::Outbound) -> Result<(), Retry<StreamError>> {
        let (generation, sink) = match self.active().await.map_err(StreamError::into_retry)? {
            Active::Ready(generation, sink) => (generation, sink),
            Active::Idle(observed) => {
                self.reconnect(observed, ClientState::Reconnecting, OpenPolicy::Single)
                    .await
                    .map_err(StreamError::into_retry)?;
                match self.active().await.map_err(StreamError::into_retry)? {
                    Active::Ready(generation, sink) => (generation, sink),
                    Active::Idle(_) => {
                        return Err(Retry::Transient(StreamError::Transport(
                            "no active session".into(),
                        )))
                    }
                }
            }
        };

        match sink.send(message).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_transport() => {
                warn!(
                    target = self.connector.target(),
                    generation,
                    %err,
                    "send failed, reconnecting"
                );
                if let Err(reconnect_err) =
                    self.reconnect(generation, ClientState::Reconnecting, OpenPolicy::Single)
                        .await
                {
                    if reconnect_err.is_terminal() {
                        return Err(Retry::Permanent(reconnect_err));
                    }
                    debug!(%reconnect_err, "reconnect after send failure did not succeed");
                }
                Err(Retry::Transient(err))
            }
            Err(err) => Err(err.into_retry()),
        }
    }

    // Returns false when cancelled.
    async fn pause(&self) -> bool {
        let delay = self.settings.max_interval().max(RECONNECT_PAUSE_FLOOR);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Keeps one management-plane stream alive across server restarts and
/// transport failures.
///
/// Inbound messages are forwarded in arrival order into a bounded queue that
/// `recv` hands out once. Sends retry under backoff and trigger a reconnect on
/// transport errors; application errors are returned immediately.
pub struct ResilientStreamClient<C: StreamConnector> {
    shared: Arc<Shared<C>>,
    inbound_tx: StdMutex<Option<mpsc::Sender<C::Inbound>>>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<C::Inbound>>>,
    receive_task: StdMutex<Option<JoinHandle<()>>>,
}

impl<C> ResilientStreamClient<C>
where
    C: StreamConnector,
    C::Outbound: Classified + Clone + Sync,
{
    pub fn new(
        connector: C,
        settings: BackoffSettings,
        inbound_capacity: usize,
        metrics: Option<Arc<AgentMetrics>>,
        parent: &CancellationToken,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let (state, _) = watch::channel(ClientState::Disconnected);
        let shared = Shared {
            connector,
            settings,
            connection: Mutex::new(Connection {
                generation: 0,
                sink: None,
                inbound: None,
                session_token: CancellationToken::new(),
                closed: false,
            }),
            state,
            cancel: parent.child_token(),
            reconnects: AtomicU64::new(0),
            metrics,
        };
        Self {
            shared: Arc::new(shared),
            inbound_tx: StdMutex::new(Some(inbound_tx)),
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            receive_task: StdMutex::new(None),
        }
    }

    pub fn classification(&self) -> Classification {
        self.shared.connector.classification()
    }

    pub fn target(&self) -> &str {
        self.shared.connector.target()
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    pub fn reconnects(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    /// Opens the stream under backoff and starts the receive loop.
    pub async fn connect(&self) -> Result<(), StreamError> {
        match self.shared.active().await? {
            Active::Ready(..) => return Ok(()),
            Active::Idle(observed) => {
                self.shared
                    .reconnect(observed, ClientState::Connecting, OpenPolicy::Backoff)
                    .await?;
            }
        }
        if self.shared.connector.has_inbound() {
            self.spawn_receive_loop();
        }
        Ok(())
    }

    fn spawn_receive_loop(&self) {
        let mut task = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let Some(tx) = self
            .inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        *task = Some(tokio::spawn(receive_loop(Arc::clone(&self.shared), tx)));
    }

    /// Hands out the inbound queue. Only the first call gets it.
    pub fn recv(&self) -> Option<mpsc::Receiver<C::Inbound>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub async fn send(&self, message: C::Outbound) -> Result<(), StreamError> {
        let expected = self.classification();
        let actual = message.classification();
        if expected != actual {
            return Err(StreamError::ClassificationMismatch { expected, actual });
        }

        let shared = &self.shared;
        wait_until(&shared.cancel, &shared.settings, || {
            let message = message.clone();
            async move { shared.send_once(message).await }
        })
        .await
        .map_err(StreamError::from_backoff)?;

        if let Some(metrics) = &shared.metrics {
            metrics.record_message_sent(expected.as_str());
        }
        Ok(())
    }

    /// Closes the send half, then the connection, and stops the receive
    /// loop. Safe to call more than once.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        {
            let mut conn = self.shared.connection.lock().await;
            if !conn.closed {
                conn.closed = true;
                conn.session_token.cancel();
                if let Some(sink) = conn.sink.take() {
                    sink.close().await;
                }
                conn.inbound = None;
                info!(target = self.shared.connector.target(), "stream client closed");
            }
        }
        self.shared.set_state(ClientState::Disconnected);

        let handle = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(%err, "receive loop terminated abnormally");
            }
        }
        self.inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl<C: StreamConnector> Drop for ResilientStreamClient<C> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn receive_loop<C: StreamConnector>(shared: Arc<Shared<C>>, tx: mpsc::Sender<C::Inbound>) {
    let target = shared.connector.target().to_string();
    loop {
        let (generation, mut inbound, session) = match shared.take_inbound().await {
            Ok(active) => active,
            Err(observed) => {
                match shared
                    .reconnect(observed, ClientState::Reconnecting, OpenPolicy::Backoff)
                    .await
                {
                    Ok(_) => continue,
                    Err(StreamError::Closed) => break,
                    Err(err) => {
                        warn!(%target, %err, "reconnect failed, will keep trying");
                        if !shared.pause().await {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return,
                _ = session.cancelled() => {
                    debug!(%target, generation, "session replaced");
                    break;
                }
                next = inbound.next() => next,
            };
            match next {
                Some(Ok(message)) => {
                    tokio::select! {
                        biased;
                        _ = shared.cancel.cancelled() => return,
                        sent = tx.send(message) => {
                            if sent.is_err() {
                                debug!(%target, "inbound queue dropped, discarding message");
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(%target, generation, %err, "receive stream failed");
                    break;
                }
                None => {
                    info!(%target, generation, "receive stream ended by peer");
                    break;
                }
            }
        }
        drop(inbound);

        match shared
            .reconnect(generation, ClientState::Reconnecting, OpenPolicy::Backoff)
            .await
        {
            Ok(_) => {}
            Err(StreamError::Closed) => break,
            Err(err) => {
                warn!(%target, %err, "reconnect failed, will keep trying");
                if !shared.pause().await {
                    break;
                }
            }
        }
    }
    debug!(%target, "receive loop stopped");
}
