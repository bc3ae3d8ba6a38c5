pub mod adapters;
pub mod app;
pub mod backoff;
pub mod domain;
pub mod ports;
pub mod settings;
pub mod telemetry;

use adapters::bus::BroadcastBus;
use adapters::config_apply::{FileManifestRepository, LocalFileSystem, ShellValidator};
use adapters::grpc::{
    load_client_tls, ClientTlsPaths, CommandConnector, EventsConnector, GrpcTransfer,
    ManagementEndpoint, MetricsConnector,
};
use anyhow::{Context, Result};
use app::config_apply::{ApplyReport, CommandDispatcher, ConfigApplyService};
use app::stream::{ClientState, ResilientStreamClient, DEFAULT_INBOUND_CAPACITY};
use app::transfer::TransferClient;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use backoff::BackoffSettings;
use chrono::Utc;
use domain::config_apply::{AllowedDirectories, ApplyEventEnvelope};
use domain::messages::{
    Classification, Classified, Envelope, EventReport, MetricSample, MetricsReport, StreamError,
};
use domain::transfer::DEFAULT_FRAME_SIZE;
use ports::stream::StreamConnector;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry::AgentMetrics;
use tokio::fs;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
const EVENT_BUS_CAPACITY: usize = 256;

type AgentApplyService =
    ConfigApplyService<LocalFileSystem, ShellValidator, FileManifestRepository, BroadcastBus>;
type AgentDispatcher = CommandDispatcher<
    LocalFileSystem,
    ShellValidator,
    FileManifestRepository,
    BroadcastBus,
    GrpcTransfer,
>;
type CommandClient = ResilientStreamClient<CommandConnector>;
type MetricsClient = ResilientStreamClient<MetricsConnector>;
type EventsClient = ResilientStreamClient<EventsConnector>;

#[derive(Clone, Debug)]
pub struct Settings {
    /// Management plane gRPC endpoint.
    pub server: String,
    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_domain: Option<String>,
    /// Local status API.
    pub listen: SocketAddr,
    pub state_dir: PathBuf,
    pub allowed_dirs: Vec<PathBuf>,
    pub validator_command: Option<String>,
    pub frame_size: usize,
    pub command_backoff: BackoffSettings,
    pub data_backoff: BackoffSettings,
    pub metrics_interval: Duration,
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8981".to_string(),
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
            tls_domain: None,
            listen: SocketAddr::from(([127, 0, 0, 1], 17719)),
            state_dir: PathBuf::from("state"),
            allowed_dirs: vec![PathBuf::from("/etc/nginx")],
            validator_command: None,
            frame_size: DEFAULT_FRAME_SIZE,
            command_backoff: BackoffSettings::control_plane(),
            data_backoff: BackoffSettings::data_plane(),
            metrics_interval: Duration::from_secs(30),
            otlp_endpoint: None,
        }
    }
}

impl Settings {
    fn tls_paths(&self) -> ClientTlsPaths {
        ClientTlsPaths {
            ca: self.tls_ca.clone(),
            cert: self.tls_cert.clone(),
            key: self.tls_key.clone(),
            domain: self.tls_domain.clone(),
        }
    }
}

/// Read-only view of one stream client for status and metrics.
trait ChannelView: Send + Sync {
    fn channel(&self) -> Classification;
    fn state(&self) -> ClientState;
    fn reconnects(&self) -> u64;
}

impl<C> ChannelView for ResilientStreamClient<C>
where
    C: StreamConnector,
    C::Outbound: Classified + Clone + Sync,
{
    fn channel(&self) -> Classification {
        self.classification()
    }

    fn state(&self) -> ClientState {
        ResilientStreamClient::state(self)
    }

    fn reconnects(&self) -> u64 {
        ResilientStreamClient::reconnects(self)
    }
}

#[derive(Clone)]
struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    started: Instant,
    server: String,
    channels: Vec<Arc<dyn ChannelView>>,
    service: Arc<AgentApplyService>,
    metrics: Option<Arc<AgentMetrics>>,
}

impl AppState {
    fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }
}

#[derive(Debug, Serialize)]
struct ChannelStatus {
    channel: Classification,
    state: ClientState,
    reconnects: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_ms: u128,
    server: String,
    channels: Vec<ChannelStatus>,
    last_apply: Option<ApplyReport>,
    telemetry_ready: bool,
}

pub async fn run(settings: Settings) -> Result<()> {
    run_until(settings, shutdown_signal()).await
}

/// Runs the agent until `shutdown` resolves, then drains every task.
pub async fn run_until<S>(settings: Settings, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    let started = Instant::now();
    let (metrics, provider) = if let Some(endpoint) = settings.otlp_endpoint.clone() {
        let (provider, metrics) =
            telemetry::init_telemetry(endpoint, "dataplane-agentd", settings.metrics_interval)?;
        (Some(Arc::new(metrics)), Some(provider))
    } else {
        (None, None)
    };

    let allowed = AllowedDirectories::new(&settings.allowed_dirs)
        .context("invalid allowed directories")?;
    fs::create_dir_all(&settings.state_dir)
        .await
        .with_context(|| format!("creating state dir {}", settings.state_dir.display()))?;
    let endpoint = management_endpoint(&settings).await?;

    let cancel = CancellationToken::new();
    let command: Arc<CommandClient> = Arc::new(ResilientStreamClient::new(
        CommandConnector::new(endpoint.clone()),
        settings.command_backoff,
        DEFAULT_INBOUND_CAPACITY,
        metrics.clone(),
        &cancel,
    ));
    let metrics_client: Arc<MetricsClient> = Arc::new(ResilientStreamClient::new(
        MetricsConnector::new(endpoint.clone()),
        settings.data_backoff,
        DEFAULT_INBOUND_CAPACITY,
        metrics.clone(),
        &cancel,
    ));
    let events_client: Arc<EventsClient> = Arc::new(ResilientStreamClient::new(
        EventsConnector::new(endpoint.clone()),
        settings.data_backoff,
        DEFAULT_INBOUND_CAPACITY,
        metrics.clone(),
        &cancel,
    ));

    let bus = Arc::new(BroadcastBus::new(EVENT_BUS_CAPACITY));
    let validator = match &settings.validator_command {
        Some(command) => ShellValidator::new(command.clone()),
        None => ShellValidator::disabled(),
    };
    let service = Arc::new(ConfigApplyService::new(
        Arc::new(LocalFileSystem::new()),
        Arc::new(validator),
        Arc::new(FileManifestRepository::new(
            settings.state_dir.join(MANIFEST_FILE),
        )),
        Arc::clone(&bus),
        allowed,
        metrics.clone(),
    ));
    let transfers = Arc::new(
        TransferClient::new(
            GrpcTransfer::new(endpoint),
            settings.frame_size,
            settings.command_backoff,
            &cancel,
            metrics.clone(),
        )
        .context("invalid frame size")?,
    );
    let dispatcher: Arc<AgentDispatcher> =
        Arc::new(CommandDispatcher::new(Arc::clone(&service), transfers));

    let state = AppState {
        inner: Arc::new(AppStateInner {
            started,
            server: settings.server.clone(),
            channels: vec![
                Arc::clone(&command) as Arc<dyn ChannelView>,
                Arc::clone(&metrics_client) as Arc<dyn ChannelView>,
                Arc::clone(&events_client) as Arc<dyn ChannelView>,
            ],
            service: Arc::clone(&service),
            metrics: metrics.clone(),
        }),
    };

    let mut tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(command_loop(
            Arc::clone(&command),
            dispatcher,
            settings.command_backoff,
            cancel.clone(),
        )),
        tokio::spawn(forward_events(
            bus.subscribe(),
            Arc::clone(&events_client),
            cancel.clone(),
        )),
        tokio::spawn(report_metrics(
            state.clone(),
            Arc::clone(&metrics_client),
            settings.metrics_interval,
            cancel.clone(),
        )),
    ];

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding status API on {}", settings.listen))?;
    let local_addr = listener.local_addr()?;
    let app = router(state);
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let server = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { cancel.cancelled().await });
            if let Err(err) = server.await {
                warn!(%err, "status API stopped");
            }
        }
    }));
    info!(
        "listening" = %local_addr,
        "server" = %settings.server,
        "state_dir" = %settings.state_dir.display(),
        "msg" = "dataplane-agentd started"
    );

    shutdown.await;
    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(%err, "agent task terminated abnormally");
        }
    }
    command.close().await;
    metrics_client.close().await;
    events_client.close().await;

    if let Some(provider) = provider {
        telemetry::shutdown_telemetry(provider)?;
    }
    info!("msg" = "dataplane-agentd stopped");
    Ok(())
}

async fn management_endpoint(settings: &Settings) -> Result<ManagementEndpoint> {
    let endpoint = ManagementEndpoint::new(settings.server.clone());
    let paths = settings.tls_paths();
    if !paths.is_enabled() {
        return Ok(endpoint);
    }
    let material = tokio::task::spawn_blocking(move || load_client_tls(&paths)).await??;
    info!(
        ca_fingerprint = material.ca_fingerprint_sha256.as_deref().unwrap_or("-"),
        identity_fingerprint = material.identity_fingerprint_sha256.as_deref().unwrap_or("-"),
        "loaded management plane TLS material"
    );
    Ok(endpoint.with_tls(material.config))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/status", get(status))
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = ctrl_c().await;
    info!("msg" = "shutdown signal received");
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let inner = &state.inner;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_ms: state.uptime().as_millis(),
        server: inner.server.clone(),
        channels: inner
            .channels
            .iter()
            .map(|channel| ChannelStatus {
                channel: channel.channel(),
                state: channel.state(),
                reconnects: channel.reconnects(),
            })
            .collect(),
        last_apply: inner.service.last_report(),
        telemetry_ready: inner.metrics.is_some(),
    })
}

/// Connects the command channel, then answers commands in arrival order,
/// coalescing apply requests that queued up behind a running apply.
async fn command_loop(
    client: Arc<CommandClient>,
    dispatcher: Arc<AgentDispatcher>,
    backoff: BackoffSettings,
    cancel: CancellationToken,
) {
    loop {
        match client.connect().await {
            Ok(()) => break,
            Err(StreamError::Closed) => return,
            Err(err) => {
                warn!(%err, "command channel unavailable, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff.max_interval()) => {}
                }
            }
        }
    }
    let Some(mut inbound) = client.recv() else {
        warn!("command inbound queue already taken");
        return;
    };

    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = inbound.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        // Everything that arrived while the previous batch was applying.
        let mut batch = vec![command];
        while let Ok(command) = inbound.try_recv() {
            batch.push(command);
        }
        // A started apply runs to completion even during shutdown.
        for reply in dispatcher.handle_batch(batch).await {
            if let Err(err) = client.send(reply).await {
                warn!(%err, "failed to send command reply");
            }
        }
    }
    debug!("command loop stopped");
}

fn event_report(event: &ApplyEventEnvelope) -> Envelope<EventReport> {
    Envelope::correlated(
        Classification::Event,
        event.correlation_id.clone(),
        EventReport {
            kind: event.event.kind().to_string(),
            payload: event.payload(),
        },
    )
}

async fn forward_events(
    mut events: broadcast::Receiver<ApplyEventEnvelope>,
    client: Arc<EventsClient>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = events.recv() => received,
        };
        match received {
            Ok(event) => {
                if let Err(err) = client.send(event_report(&event)).await {
                    warn!(kind = event.event.kind(), %err, "failed to forward apply event");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event forwarder fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("event forwarder stopped");
}

fn metrics_snapshot(state: &AppState) -> MetricsReport {
    let inner = &state.inner;
    let mut samples = vec![MetricSample::new(
        "agent.uptime_seconds",
        state.uptime().as_secs_f64(),
    )];
    samples.extend(
        inner
            .service
            .outcome_totals()
            .into_iter()
            .map(|(outcome, total)| {
                MetricSample::new("agent.config_apply.total", total as f64)
                    .with_attribute("outcome", outcome.as_str())
            }),
    );
    samples.extend(inner.channels.iter().map(|channel| {
        MetricSample::new("agent.stream.reconnects", channel.reconnects() as f64)
            .with_attribute("channel", channel.channel().as_str())
    }));
    MetricsReport { samples }
}

async fn report_metrics(
    state: AppState,
    client: Arc<MetricsClient>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = Envelope::metric(metrics_snapshot(&state));
        if let Err(err) = client.send(report).await {
            warn!(%err, "failed to send metrics report");
        }
    }
    debug!("metrics reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config_apply::{ApplyEvent, ApplyOutcome};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::TryStreamExt;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct FixedChannel(Classification, ClientState, u64);

    impl ChannelView for FixedChannel {
        fn channel(&self) -> Classification {
            self.0
        }

        fn state(&self) -> ClientState {
            self.1
        }

        fn reconnects(&self) -> u64 {
            self.2
        }
    }

    fn test_state(temp: &TempDir) -> AppState {
        let root = temp.path().join("etc");
        let service = ConfigApplyService::new(
            Arc::new(LocalFileSystem::new()),
            Arc::new(ShellValidator::disabled()),
            Arc::new(FileManifestRepository::new(temp.path().join(MANIFEST_FILE))),
            Arc::new(BroadcastBus::new(8)),
            AllowedDirectories::new([&root]).unwrap(),
            None,
        );
        AppState {
            inner: Arc::new(AppStateInner {
                started: Instant::now(),
                server: "http://mp.test:8981".into(),
                channels: vec![
                    Arc::new(FixedChannel(Classification::Command, ClientState::Streaming, 2)),
                    Arc::new(FixedChannel(
                        Classification::Metric,
                        ClientState::Reconnecting,
                        0,
                    )),
                ],
                service: Arc::new(service),
                metrics: None,
            }),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response
            .into_body()
            .into_data_stream()
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let temp = TempDir::new().unwrap();
        let response = router(test_state(&temp))
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn status_lists_channels_and_last_apply() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);
        state
            .inner
            .service
            .reject("cfg-1", "corr-1", "download failed".into());

        let response = router(state)
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["server"], "http://mp.test:8981");
        assert_eq!(body["channels"][0]["channel"], "command");
        assert_eq!(body["channels"][0]["state"], "streaming");
        assert_eq!(body["channels"][0]["reconnects"], 2);
        assert_eq!(body["channels"][1]["state"], "reconnecting");
        assert_eq!(body["last_apply"]["outcome"], "rejected");
        assert_eq!(body["telemetry_ready"], false);
    }

    #[tokio::test]
    async fn metrics_snapshot_counts_outcomes_and_reconnects() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);
        state.inner.service.reject("cfg-1", "corr", "bad".into());

        let report = metrics_snapshot(&state);
        let rejected = report
            .samples
            .iter()
            .find(|sample| {
                sample.name == "agent.config_apply.total"
                    && sample.attributes.get("outcome").map(String::as_str) == Some("rejected")
            })
            .unwrap();
        assert_eq!(rejected.value, 1.0);
        let reconnects: Vec<f64> = report
            .samples
            .iter()
            .filter(|sample| sample.name == "agent.stream.reconnects")
            .map(|sample| sample.value)
            .collect();
        assert_eq!(reconnects, vec![2.0, 0.0]);
        assert_eq!(
            report
                .samples
                .iter()
                .filter(|sample| sample.name == "agent.config_apply.total")
                .count(),
            ApplyOutcome::ALL.len()
        );
    }

    #[test]
    fn apply_events_keep_their_correlation() {
        let event = ApplyEventEnvelope::new(
            "corr-9",
            ApplyEvent::RolledBack {
                config_id: "cfg-9".into(),
                reason: "validation failed".into(),
            },
        );
        let report = event_report(&event);
        assert_eq!(report.classification, Classification::Event);
        assert_eq!(report.correlation_id, "corr-9");
        assert_eq!(report.payload.kind, "apply.rolled_back");
        assert_eq!(report.payload.payload["config_id"], "cfg-9");
        assert_eq!(report.payload.payload["correlation_id"], "corr-9");
    }
}
