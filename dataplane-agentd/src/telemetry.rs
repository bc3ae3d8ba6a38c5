use crate::domain::config_apply::ApplyOutcome;
use anyhow::{Context, Result};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use std::time::Duration;
use tracing::info;

/// Agent telemetry instruments
pub struct AgentMetrics {
    // Stream resilience
    pub reconnects: Counter<u64>,
    pub messages_sent: Counter<u64>,

    // Config apply
    pub apply_outcomes: Counter<u64>,
    pub apply_latency: Histogram<f64>,

    // Chunked transfers
    pub transfer_bytes: Counter<u64>,
}

impl AgentMetrics {
    pub fn new(meter: &Meter) -> Self {
        let reconnects = meter
            .u64_counter("dataplane.stream.reconnects")
            .with_description("Stream reconnections per channel")
            .build();

        let messages_sent = meter
            .u64_counter("dataplane.stream.messages_sent")
            .with_description("Messages delivered per channel")
            .build();

        let apply_outcomes = meter
            .u64_counter("dataplane.config_apply.outcomes")
            .with_description("Config apply results by outcome")
            .build();

        let apply_latency = meter
            .f64_histogram("dataplane.config_apply.latency_ms")
            .with_description("End-to-end config apply latency in milliseconds")
            .build();

        let transfer_bytes = meter
            .u64_counter("dataplane.transfer.bytes")
            .with_description("Payload bytes moved by chunked transfers")
            .build();

        Self {
            reconnects,
            messages_sent,
            apply_outcomes,
            apply_latency,
            transfer_bytes,
        }
    }

    pub fn record_reconnect(&self, channel: &str) {
        self.reconnects
            .add(1, &[KeyValue::new("channel", channel.to_string())]);
    }

    pub fn record_message_sent(&self, channel: &str) {
        self.messages_sent
            .add(1, &[KeyValue::new("channel", channel.to_string())]);
    }

    pub fn record_apply(&self, outcome: ApplyOutcome, duration_ms: f64) {
        let attrs = [KeyValue::new("outcome", outcome.as_str())];
        self.apply_outcomes.add(1, &attrs);
        self.apply_latency.record(duration_ms, &attrs);
    }

    /// `direction` is either "download" or "upload".
    pub fn record_transfer(&self, direction: &'static str, bytes: usize) {
        self.transfer_bytes
            .add(bytes as u64, &[KeyValue::new("direction", direction)]);
    }
}

/// Initialize OTLP metric export and the agent instruments
pub fn init_telemetry(
    endpoint: String,
    service_name: &str,
    export_interval: Duration,
) -> Result<(SdkMeterProvider, AgentMetrics)> {
    info!(%endpoint, "initializing OTLP telemetry");

    let export_config = opentelemetry_otlp::ExportConfig {
        endpoint: Some(endpoint),
        timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_export_config(export_config)
        .build()
        .context("building OTLP metric exporter")?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .with_interval(export_interval)
    .build();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());

    let meter = global::meter("dataplane-agentd");
    let metrics = AgentMetrics::new(&meter);

    Ok((provider, metrics))
}

pub fn shutdown_telemetry(provider: SdkMeterProvider) -> Result<()> {
    info!("shutting down telemetry");
    provider
        .shutdown()
        .context("shutting down meter provider")?;
    Ok(())
}
