use crate::backoff::{BackoffSettings, BackoffSettingsError};
use crate::Settings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backoff knobs as written in the config file. Missing fields keep the
/// value of the preset being overridden.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    /// Zero disables the overall deadline.
    pub max_elapsed_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub randomization_factor: Option<f64>,
}

impl BackoffConfig {
    pub fn resolve(&self, base: &BackoffSettings) -> Result<BackoffSettings, BackoffSettingsError> {
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        BackoffSettings::new(
            ms(self.initial_interval_ms, base.initial_interval()),
            ms(self.max_interval_ms, base.max_interval()),
            ms(self.max_elapsed_ms, base.max_elapsed_time()),
            self.multiplier.unwrap_or(base.multiplier()),
            self.randomization_factor
                .unwrap_or(base.randomization_factor()),
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsFileSettings {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub domain: Option<String>,
}

/// Optional JSON config file. Every field overrides the built-in default;
/// command line flags are applied afterwards and win.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub server: Option<String>,
    pub listen: Option<SocketAddr>,
    pub state_dir: Option<PathBuf>,
    pub allowed_dirs: Option<Vec<PathBuf>>,
    pub validator_command: Option<String>,
    pub frame_size: Option<usize>,
    pub metrics_interval_ms: Option<u64>,
    pub otlp_endpoint: Option<String>,
    pub tls: Option<TlsFileSettings>,
    pub command_backoff: Option<BackoffConfig>,
    pub data_backoff: Option<BackoffConfig>,
}

impl FileSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn apply_to(self, settings: &mut Settings) -> Result<()> {
        if let Some(server) = self.server {
            settings.server = server;
        }
        if let Some(listen) = self.listen {
            settings.listen = listen;
        }
        if let Some(state_dir) = self.state_dir {
            settings.state_dir = state_dir;
        }
        if let Some(allowed_dirs) = self.allowed_dirs {
            settings.allowed_dirs = allowed_dirs;
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
        if let Some(tls) = self.tls {
            settings.tls_ca = tls.ca.or(settings.tls_ca.take());
            settings.tls_cert = tls.cert.or(settings.tls_cert.take());
            settings.tls_key = tls.key.or(settings.tls_key.take());
            settings.tls_domain = tls.domain.or(settings.tls_domain.take());
        }
        if let Some(backoff) = self.command_backoff {
            settings.command_backoff = backoff
                .resolve(&settings.command_backoff)
                .context("invalid command_backoff")?;
        }
        if let Some(backoff) = self.data_backoff {
            settings.data_backoff = backoff
                .resolve(&settings.data_backoff)
                .context("invalid data_backoff")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn overlay_replaces_only_given_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agent.json");
        std::fs::write(
            &path,
            r#"{
                "server": "https://mp.example:8443",
                "allowed_dirs": ["/etc/nginx", "/usr/share/nginx/html"],
                "validator_command": "nginx -t",
                "command_backoff": { "max_elapsed_ms": 10000 },
                "tls": { "domain": "mp.example" }
            }"#,
        )
        .unwrap();

        let mut settings = Settings::default();
        FileSettings::load(&path)
            .unwrap()
            .apply_to(&mut settings)
            .unwrap();

        assert_eq!(settings.server, "https://mp.example:8443");
        assert_eq!(settings.allowed_dirs.len(), 2);
        assert_eq!(settings.validator_command.as_deref(), Some("nginx -t"));
        assert_eq!(settings.tls_domain.as_deref(), Some("mp.example"));
        assert_eq!(
            settings.command_backoff.max_elapsed_time(),
            Duration::from_secs(10)
        );
        assert_eq!(
            settings.command_backoff.initial_interval(),
            BackoffSettings::control_plane().initial_interval()
        );
        assert_eq!(settings.frame_size, Settings::default().frame_size);
    }

    #[test]
    fn invalid_backoff_is_reported() {
        let file = FileSettings {
            data_backoff: Some(BackoffConfig {
                initial_interval_ms: Some(90_000),
                ..BackoffConfig::default()
            }),
            ..FileSettings::default()
        };
        let err = file.apply_to(&mut Settings::default()).unwrap_err();
        assert!(err.to_string().contains("data_backoff"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_str::<FileSettings>(r#"{"sever": "typo"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }
}
