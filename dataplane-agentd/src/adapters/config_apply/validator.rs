use crate::ports::config_apply::ConfigValidator;
use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Runs a shell command (for example `nginx -t`) and treats a non-zero exit
/// as a rejected configuration. Without a command every configuration passes.
#[derive(Debug, Clone, Default)]
pub struct ShellValidator {
    command: Option<String>,
}

impl ShellValidator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }
}

#[async_trait]
impl ConfigValidator for ShellValidator {
    async fn validate(&self) -> anyhow::Result<()> {
        let Some(cmd) = &self.command else {
            debug!("no validator configured, accepting configuration");
            return Ok(());
        };

        #[cfg(windows)]
        let output = Command::new("cmd.exe").arg("/C").arg(cmd).output().await;
        #[cfg(not(windows))]
        let output = Command::new("sh").arg("-c").arg(cmd).output().await;

        let output = output.with_context(|| format!("failed to spawn validator '{cmd}'"))?;
        debug!(command = %cmd, status = %output.status, "validator finished");
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("validator '{cmd}' exited with {}: {}", output.status, stderr.trim())
    }
}
