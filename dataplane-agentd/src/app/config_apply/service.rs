use crate::domain::config_apply::{
    AllowedDirectories, ApplyEvent, ApplyEventEnvelope, ApplyOutcome, ConfigApplyTransaction,
    ConfigBundle, Manifest, PathPolicyError, RollbackError, TransactionError,
};
use crate::domain::messages::ApplyResult;
use crate::ports::bus::EventPublisher;
use crate::ports::config_apply::{ConfigFileSystem, ConfigValidator, ManifestRepository};
use crate::telemetry::AgentMetrics;
use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigApplyError {
    #[error("bundle rejected: {0}")]
    Preflight(#[from] PathPolicyError),
    #[error("manifest unavailable: {0:#}")]
    Manifest(anyhow::Error),
    #[error("inspecting current files failed: {0:#}")]
    Inspect(anyhow::Error),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    RolledBack(RollbackError),
}

impl ConfigApplyError {
    pub fn outcome(&self) -> ApplyOutcome {
        match self {
            ConfigApplyError::RolledBack(err) if err.is_complete() => ApplyOutcome::RolledBack,
            ConfigApplyError::RolledBack(_) => ApplyOutcome::RollbackFailed,
            _ => ApplyOutcome::Rejected,
        }
    }
}

/// Outcome of one apply, as reported back to the management plane.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApplyReport {
    pub config_id: String,
    pub outcome: ApplyOutcome,
    pub message: String,
    pub error: Option<String>,
    pub written: usize,
    pub purged: Vec<PathBuf>,
    pub failures: Vec<String>,
}

impl ApplyReport {
    fn new(config_id: &str, outcome: ApplyOutcome, message: impl Into<String>) -> Self {
        Self {
            config_id: config_id.to_string(),
            outcome,
            message: message.into(),
            error: None,
            written: 0,
            purged: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn rejected(config_id: &str, reason: impl Into<String>) -> Self {
        let mut report = Self::new(config_id, ApplyOutcome::Rejected, "configuration rejected");
        report.error = Some(reason.into());
        report
    }

    fn failed(config_id: &str, err: ConfigApplyError) -> Self {
        let outcome = err.outcome();
        let mut report = match outcome {
            ApplyOutcome::RolledBack => {
                Self::new(config_id, outcome, "configuration rolled back")
            }
            ApplyOutcome::RollbackFailed => {
                Self::new(config_id, outcome, "rollback did not complete")
            }
            _ => Self::new(config_id, outcome, "configuration rejected"),
        };
        report.error = Some(err.to_string());
        if let ConfigApplyError::RolledBack(rollback) = &err {
            report.failures = rollback.failures.iter().map(ToString::to_string).collect();
        }
        report
    }

    pub fn to_result(&self) -> ApplyResult {
        ApplyResult {
            config_id: self.config_id.clone(),
            outcome: self.outcome,
            message: self.message.clone(),
            error: self.error.clone(),
        }
    }

    fn event(&self) -> ApplyEvent {
        let config_id = self.config_id.clone();
        let reason = self.error.clone().unwrap_or_default();
        match self.outcome {
            ApplyOutcome::Applied => ApplyEvent::Succeeded {
                config_id,
                written: self.written,
                purged: self.purged.clone(),
            },
            ApplyOutcome::NoChange => ApplyEvent::NoChange { config_id },
            ApplyOutcome::RolledBack => ApplyEvent::RolledBack { config_id, reason },
            ApplyOutcome::RollbackFailed => ApplyEvent::RollbackFailed {
                config_id,
                reason,
                failures: self.failures.clone(),
            },
            ApplyOutcome::Rejected => ApplyEvent::Rejected { config_id, reason },
        }
    }
}

enum Applied {
    Unchanged,
    Committed {
        written: usize,
        purged: Vec<PathBuf>,
        warnings: Vec<String>,
    },
}

pub struct ConfigApplyService<F, V, M, B>
where
    F: ConfigFileSystem,
    V: ConfigValidator,
    M: ManifestRepository,
    B: EventPublisher,
{
    files: Arc<F>,
    validator: Arc<V>,
    manifests: Arc<M>,
    bus: Arc<B>,
    allowed: AllowedDirectories,
    metrics: Option<Arc<AgentMetrics>>,
    // One transaction at a time; they all share the manifest.
    apply_lock: Mutex<()>,
    last_report: std::sync::Mutex<Option<ApplyReport>>,
    totals: [AtomicU64; ApplyOutcome::ALL.len()],
}

impl<F, V, M, B> ConfigApplyService<F, V, M, B>
where
    F: ConfigFileSystem,
    V: ConfigValidator,
    M: ManifestRepository,
    B: EventPublisher,
{
    pub fn new(
        files: Arc<F>,
        validator: Arc<V>,
        manifests: Arc<M>,
        bus: Arc<B>,
        allowed: AllowedDirectories,
        metrics: Option<Arc<AgentMetrics>>,
    ) -> Self {
        Self {
            files,
            validator,
            manifests,
            bus,
            allowed,
            metrics,
            apply_lock: Mutex::new(()),
            last_report: std::sync::Mutex::new(None),
            totals: Default::default(),
        }
    }

    pub fn allowed(&self) -> &AllowedDirectories {
        &self.allowed
    }

    pub fn last_report(&self) -> Option<ApplyReport> {
        self.last_report
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of finished applies per outcome since start.
    pub fn outcome_totals(&self) -> Vec<(ApplyOutcome, u64)> {
        ApplyOutcome::ALL
            .iter()
            .zip(&self.totals)
            .map(|(outcome, total)| (*outcome, total.load(Ordering::Relaxed)))
            .collect()
    }

    /// Applies `bundle` transactionally and publishes the outcome.
    pub async fn apply(&self, bundle: &ConfigBundle, correlation_id: &str) -> ApplyReport {
        let _guard = self.apply_lock.lock().await;
        let started = Instant::now();
        self.bus.publish(ApplyEventEnvelope::new(
            correlation_id,
            ApplyEvent::Pending {
                config_id: bundle.config_id.clone(),
            },
        ));

        let report = match self.apply_locked(bundle).await {
            Ok(Applied::Unchanged) => ApplyReport::new(
                &bundle.config_id,
                ApplyOutcome::NoChange,
                "configuration already applied",
            ),
            Ok(Applied::Committed {
                written,
                purged,
                warnings,
            }) => {
                let mut report =
                    ApplyReport::new(&bundle.config_id, ApplyOutcome::Applied, "configuration applied");
                report.written = written;
                report.purged = purged;
                if !warnings.is_empty() {
                    report.error = Some(warnings.join("; "));
                }
                report
            }
            Err(err) => {
                warn!(config_id = %bundle.config_id, %err, "config apply failed");
                ApplyReport::failed(&bundle.config_id, err)
            }
        };

        self.finish(correlation_id, report, started)
    }

    /// Reads the applied configuration back from disk. Waits out a running
    /// apply so the bundle never mixes two versions.
    pub async fn current_bundle(&self) -> anyhow::Result<ConfigBundle> {
        let _guard = self.apply_lock.lock().await;
        let manifest = self.manifests.load().await.context("loading manifest")?;
        let Some(config_id) = manifest.config_id else {
            anyhow::bail!("no configuration has been applied yet");
        };
        let mut files = Vec::with_capacity(manifest.files.len());
        for path in &manifest.files {
            if !self.allowed.contains(path) {
                warn!(path = %path.display(), "managed path outside allowed directories, skipping");
                continue;
            }
            files.push(self.files.read(path).await?);
        }
        Ok(ConfigBundle { config_id, files })
    }

    /// Reports a request that never reached the transaction, such as a failed
    /// download.
    pub fn reject(&self, config_id: &str, correlation_id: &str, reason: String) -> ApplyReport {
        warn!(%config_id, %reason, "config apply rejected");
        self.finish(
            correlation_id,
            ApplyReport::rejected(config_id, reason),
            Instant::now(),
        )
    }

    fn finish(&self, correlation_id: &str, report: ApplyReport, started: Instant) -> ApplyReport {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Some(slot) = ApplyOutcome::ALL
            .iter()
            .position(|outcome| *outcome == report.outcome)
        {
            self.totals[slot].fetch_add(1, Ordering::Relaxed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_apply(report.outcome, elapsed_ms);
        }
        info!(
            config_id = %report.config_id,
            outcome = %report.outcome,
            elapsed_ms,
            "config apply finished"
        );
        self.bus
            .publish(ApplyEventEnvelope::new(correlation_id, report.event()));
        *self
            .last_report
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(report.clone());
        report
    }

    async fn apply_locked(&self, bundle: &ConfigBundle) -> Result<Applied, ConfigApplyError> {
        bundle.preflight(&self.allowed)?;
        let manifest = self
            .manifests
            .load()
            .await
            .map_err(ConfigApplyError::Manifest)?;

        if self.is_unchanged(bundle, &manifest).await? {
            debug!(config_id = %bundle.config_id, "bundle matches files on disk");
            return Ok(Applied::Unchanged);
        }

        let mut transaction =
            ConfigApplyTransaction::open(&manifest.files, self.allowed.clone()).await?;
        for file in &bundle.files {
            transaction.mark_and_save(&file.path).await?;
        }

        for file in &bundle.files {
            if let Err(err) = self.files.write(file).await {
                let cause = err.context(format!("writing {}", file.path.display()));
                return Err(ConfigApplyError::RolledBack(transaction.rollback(cause).await));
            }
        }

        if let Err(err) = self.validator.validate().await {
            let cause = err.context("validation failed");
            return Err(ConfigApplyError::RolledBack(transaction.rollback(cause).await));
        }

        let mut warnings = Vec::new();
        let purged = match transaction.commit().await {
            Ok(summary) => summary.purged,
            Err(err) => {
                warn!(%err, "commit left orphaned files behind");
                warnings.extend(err.failures.iter().map(ToString::to_string));
                err.purged
            }
        };

        if let Err(err) = self.manifests.store(&Manifest::from_bundle(bundle)).await {
            warn!(%err, "failed to persist manifest");
            warnings.push(format!("persisting manifest: {err:#}"));
        }

        Ok(Applied::Committed {
            written: bundle.files.len(),
            purged,
            warnings,
        })
    }

    async fn is_unchanged(
        &self,
        bundle: &ConfigBundle,
        manifest: &Manifest,
    ) -> Result<bool, ConfigApplyError> {
        if bundle.paths().any(|path| !manifest.files.contains(path)) {
            return Ok(false);
        }
        for orphan in manifest.orphans(bundle) {
            if !self.allowed.contains(orphan) {
                continue;
            }
            if self
                .files
                .inspect(orphan)
                .await
                .map_err(ConfigApplyError::Inspect)?
                .is_some()
            {
                return Ok(false);
            }
        }
        for file in &bundle.files {
            let current = self
                .files
                .inspect(&file.path)
                .await
                .map_err(ConfigApplyError::Inspect)?;
            match current {
                Some(on_disk) if on_disk.matches(file) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
