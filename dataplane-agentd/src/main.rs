use anyhow::Result;
use clap::Parser;
use dataplane_agentd::settings::FileSettings;
use dataplane_agentd::{run, Settings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Data plane agent daemon", long_about = None)]
struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON config file; command line flags override its values"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        help = "Management plane gRPC endpoint [default: http://127.0.0.1:8981]"
    )]
    server: Option<String>,

    #[arg(long, value_name = "PATH", help = "PEM CA bundle used to verify the management plane")]
    tls_ca: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "PEM client certificate for mutual TLS")]
    tls_cert: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "PEM client private key for mutual TLS")]
    tls_key: Option<PathBuf>,

    #[arg(long, help = "Server name expected in the management plane certificate")]
    tls_domain: Option<String>,

    #[arg(
        long,
        help = "Listen address for the local status API [default: 127.0.0.1:17719]"
    )]
    listen: Option<SocketAddr>,

    #[arg(long, help = "Directory for the manifest and other agent state [default: state]")]
    state_dir: Option<PathBuf>,

    #[arg(
        long = "allowed-dir",
        value_name = "DIR",
        help = "Directory the agent may write configuration into (repeatable)"
    )]
    allowed_dirs: Vec<PathBuf>,

    #[arg(long, help = "Command validating written configuration, e.g. 'nginx -t'")]
    validator_command: Option<String>,

    #[arg(long, help = "Chunk size in bytes for bundle transfers [default: 4096]")]
    frame_size: Option<usize>,

    #[arg(long, help = "Interval between metrics reports in milliseconds")]
    metrics_interval_ms: Option<u64>,

    #[arg(long, help = "OTLP endpoint for telemetry (e.g., http://localhost:4318)")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn into_settings(self) -> Result<Settings> {
        let mut settings = Settings::default();
        if let Some(path) = &self.config {
            FileSettings::load(path)?.apply_to(&mut settings)?;
        }

        if let Some(server) = self.server {
            settings.server = server;
        }
        if self.tls_ca.is_some() {
            settings.tls_ca = self.tls_ca;
        }
        if self.tls_cert.is_some() {
            settings.tls_cert = self.tls_cert;
        }
        if self.tls_key.is_some() {
            settings.tls_key = self.tls_key;
        }
        if self.tls_domain.is_some() {
            settings.tls_domain = self.tls_domain;
        }
        if let Some(listen) = self.listen {
            settings.listen = listen;
        }
        if let Some(state_dir) = self.state_dir {
            settings.state_dir = state_dir;
        }
        if !self.allowed_dirs.is_empty() {
            settings.allowed_dirs = self.allowed_dirs;
        }
        if self.validator_command.is_some() {
            settings.validator_command = self.validator_command;
        }
        if let Some(frame_size) = self.frame_size {
            settings.frame_size = frame_size;
        }
        if let Some(ms) = self.metrics_interval_ms {
            settings.metrics_interval = Duration::from_millis(ms);
        }
        if self.otlp_endpoint.is_some() {
            settings.otlp_endpoint = self.otlp_endpoint;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    run(cli.into_settings()?).await
}
