use super::service::{ApplyReport, ConfigApplyService};
use crate::app::transfer::TransferClient;
use crate::domain::config_apply::{ApplyOutcome, ConfigBundle};
use crate::domain::messages::{CommandPayload, Envelope};
use crate::ports::bus::EventPublisher;
use crate::ports::config_apply::{ConfigFileSystem, ConfigValidator, ManifestRepository};
use crate::ports::transfer::TransferPort;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns inbound commands into config applies and builds the replies.
pub struct CommandDispatcher<F, V, M, B, P>
where
    F: ConfigFileSystem,
    V: ConfigValidator,
    M: ManifestRepository,
    B: EventPublisher,
    P: TransferPort,
{
    service: Arc<ConfigApplyService<F, V, M, B>>,
    transfers: Arc<TransferClient<P>>,
}

impl<F, V, M, B, P> CommandDispatcher<F, V, M, B, P>
where
    F: ConfigFileSystem,
    V: ConfigValidator,
    M: ManifestRepository,
    B: EventPublisher,
    P: TransferPort,
{
    pub fn new(
        service: Arc<ConfigApplyService<F, V, M, B>>,
        transfers: Arc<TransferClient<P>>,
    ) -> Self {
        Self { service, transfers }
    }

    /// Returns the reply to send back on the command channel, if any.
    pub async fn handle(
        &self,
        command: Envelope<CommandPayload>,
    ) -> Option<Envelope<CommandPayload>> {
        match &command.payload {
            CommandPayload::ConfigApplyRequest { config_id } => {
                info!(
                    %config_id,
                    correlation_id = %command.correlation_id,
                    "config apply requested"
                );
                let report = self.apply(config_id, &command.correlation_id).await;
                Some(Envelope::reply_to(
                    &command,
                    CommandPayload::ConfigApplyResponse(report.to_result()),
                ))
            }
            CommandPayload::ConfigUploadRequest { config_id } => {
                info!(
                    %config_id,
                    correlation_id = %command.correlation_id,
                    "config upload requested"
                );
                let status = match self.upload_current(config_id, &command.correlation_id).await {
                    Ok(files) => CommandPayload::Status {
                        ok: true,
                        message: format!("uploaded {files} file(s) of {config_id}"),
                    },
                    Err(err) => {
                        warn!(%config_id, error = %format!("{err:#}"), "config upload failed");
                        CommandPayload::Status {
                            ok: false,
                            message: format!("config upload failed: {err:#}"),
                        }
                    }
                };
                Some(Envelope::reply_to(&command, status))
            }
            CommandPayload::Status { ok, message } => {
                debug!(ok, %message, "management plane status");
                None
            }
            CommandPayload::ConfigApplyResponse(result) => {
                warn!(config_id = %result.config_id, "ignoring apply response sent to the agent");
                None
            }
        }
    }

    /// Handles commands that queued up behind a running apply, in arrival
    /// order. Apply requests are coalesced: only the newest one is applied and
    /// every older one is answered with its result.
    pub async fn handle_batch(
        &self,
        commands: Vec<Envelope<CommandPayload>>,
    ) -> Vec<Envelope<CommandPayload>> {
        let is_apply = |command: &Envelope<CommandPayload>| {
            matches!(command.payload, CommandPayload::ConfigApplyRequest { .. })
        };
        let newest = commands.iter().rposition(is_apply);
        let mut superseded = Vec::new();
        let mut replies = Vec::new();

        for (index, command) in commands.into_iter().enumerate() {
            if is_apply(&command) && Some(index) != newest {
                superseded.push(command);
                continue;
            }
            let Some(reply) = self.handle(command).await else {
                continue;
            };
            if let CommandPayload::ConfigApplyResponse(result) = &reply.payload {
                if !superseded.is_empty() {
                    info!(
                        config_id = %result.config_id,
                        superseded = superseded.len(),
                        "answering superseded apply requests"
                    );
                }
                for request in superseded.drain(..) {
                    replies.push(Envelope::reply_to(
                        &request,
                        CommandPayload::ConfigApplyResponse(result.clone()),
                    ));
                }
            }
            replies.push(reply);
        }
        replies
    }

    async fn upload_current(&self, config_id: &str, correlation_id: &str) -> anyhow::Result<usize> {
        let bundle = self.service.current_bundle().await?;
        if bundle.config_id != config_id {
            anyhow::bail!(
                "{config_id} is not applied, the current configuration is {}",
                bundle.config_id
            );
        }
        self.transfers.upload(&bundle, correlation_id).await?;
        Ok(bundle.files.len())
    }

    async fn apply(&self, config_id: &str, correlation_id: &str) -> ApplyReport {
        let bundle: ConfigBundle = match self.transfers.download(config_id, correlation_id).await {
            Ok(bundle) => bundle,
            Err(err) => {
                return self
                    .service
                    .reject(config_id, correlation_id, format!("download failed: {err}"))
            }
        };
        if bundle.config_id != config_id {
            return self.service.reject(
                config_id,
                correlation_id,
                format!("downloaded bundle is {}, expected {config_id}", bundle.config_id),
            );
        }

        let report = self.service.apply(&bundle, correlation_id).await;
        if report.outcome == ApplyOutcome::Applied {
            // Upload failures never change the reported outcome.
            if let Err(err) = self.transfers.upload(&bundle, correlation_id).await {
                warn!(%config_id, %err, "failed to upload applied bundle");
            }
        }
        report
    }
}
