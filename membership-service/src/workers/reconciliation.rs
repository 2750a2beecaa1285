use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ReconciliationConfig;
use crate::models::{error_codes, AttemptOutcome, OperationResult, RetryRecord};
use crate::services::metrics;
use crate::services::providers::ProviderRegistry;
use crate::services::retry_store::RetryStore;
use service_core::error::AppError;

/// Tally of one pass over the due records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The cycle did nothing because reconciliation is switched off.
    pub disabled: bool,
    pub fetched: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Another worker held the lease.
    pub skipped: usize,
    /// Store errors while handling a record; the record is left for a later cycle.
    pub errors: usize,
}

enum RecordOutcome {
    Succeeded,
    Retried,
    DeadLettered,
    Skipped,
}

/// Drains the retry store by replaying each due record against its provider.
///
/// Several instances may run against one durable store; `claim_record` keeps
/// them from processing the same record.
pub struct ReconciliationWorker {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn RetryStore>,
    config: ReconciliationConfig,
}

impl ReconciliationWorker {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn RetryStore>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, AppError> {
        if !self.config.enabled {
            tracing::debug!("Reconciliation disabled, skipping cycle");
            return Ok(CycleReport {
                disabled: true,
                ..Default::default()
            });
        }

        let started = Instant::now();
        let due = self.store.fetch_due(self.config.batch_size).await?;
        let mut report = CycleReport {
            fetched: due.len(),
            ..Default::default()
        };

        for record in due {
            let record_id = record.id.clone();
            match self.process_record(record).await {
                Ok(RecordOutcome::Succeeded) => {
                    report.claimed += 1;
                    report.succeeded += 1;
                    metrics::record_reconciliation_outcome("succeeded");
                }
                Ok(RecordOutcome::Retried) => {
                    report.claimed += 1;
                    report.retried += 1;
                    metrics::record_reconciliation_outcome("retried");
                }
                Ok(RecordOutcome::DeadLettered) => {
                    report.claimed += 1;
                    report.dead_lettered += 1;
                    metrics::record_reconciliation_outcome("dead_lettered");
                }
                Ok(RecordOutcome::Skipped) => {
                    report.skipped += 1;
                    metrics::record_reconciliation_outcome("skipped");
                }
                Err(e) => {
                    report.errors += 1;
                    metrics::record_reconciliation_outcome("error");
                    tracing::error!(
                        record_id = %record_id,
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Failed to reconcile retry record"
                    );
                }
            }
        }

        if report.fetched > 0 {
            tracing::info!(
                worker_id = %self.config.worker_id,
                fetched = report.fetched,
                succeeded = report.succeeded,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                skipped = report.skipped,
                errors = report.errors,
                duration_ms = started.elapsed().as_millis() as u64,
                "Reconciliation cycle finished"
            );
        }
        Ok(report)
    }

    async fn process_record(&self, record: RetryRecord) -> Result<RecordOutcome, AppError> {
        let claimed = self
            .store
            .claim_record(
                &record.id,
                &self.config.worker_id,
                self.config.claim_lease_seconds,
            )
            .await?;
        if !claimed {
            tracing::debug!(record_id = %record.id, "Record claimed by another worker");
            return Ok(RecordOutcome::Skipped);
        }

        let payload = &record.payload;
        let action = payload.action;
        let result = match self.registry.get(&payload.provider) {
            Some(provider) => {
                let justification = format!("reconciliation of {}", payload.correlation_id);
                provider
                    .apply(
                        action,
                        &payload.group_id,
                        &payload.member_email,
                        Some(&justification),
                    )
                    .await
            }
            None => OperationResult::permanent(format!(
                "provider {} is no longer registered",
                payload.provider
            ))
            .with_error_code(error_codes::PROVIDER_NOT_REGISTERED),
        };

        if action.is_terminal(result.status) {
            self.store.mark_success(&record.id).await?;
            tracing::info!(
                record_id = %record.id,
                provider = %payload.provider,
                group_id = %payload.group_id,
                correlation_id = %payload.correlation_id,
                attempts = record.attempts + 1,
                "Propagation reconciled"
            );
            return Ok(RecordOutcome::Succeeded);
        }

        // Permanent errors take the same path: they will not succeed on replay,
        // so each attempt moves them toward dead-letter.
        match self.store.increment_attempt(&record.id, &result.summary()).await? {
            AttemptOutcome::Rescheduled {
                attempts,
                next_retry_at,
            } => {
                tracing::warn!(
                    record_id = %record.id,
                    provider = %payload.provider,
                    group_id = %payload.group_id,
                    correlation_id = %payload.correlation_id,
                    attempts,
                    next_retry_at = %next_retry_at,
                    status = %result.status,
                    "Propagation replay failed, rescheduled"
                );
                Ok(RecordOutcome::Retried)
            }
            AttemptOutcome::DeadLettered { attempts } => {
                tracing::error!(
                    record_id = %record.id,
                    provider = %payload.provider,
                    group_id = %payload.group_id,
                    correlation_id = %payload.correlation_id,
                    attempts,
                    last_error = %result.summary(),
                    "Propagation dead-lettered"
                );
                Ok(RecordOutcome::DeadLettered)
            }
        }
    }

    /// Run cycles on the configured interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                worker_id = %self.config.worker_id,
                interval_seconds = self.config.interval_seconds,
                batch_size = self.config.batch_size,
                enabled = self.config.enabled,
                "Reconciliation worker started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(
                            worker_id = %self.config.worker_id,
                            "Reconciliation worker stopping"
                        );
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            tracing::error!(
                                worker_id = %self.config.worker_id,
                                error = %e,
                                "Reconciliation cycle failed"
                            );
                        }
                    }
                }
            }
        })
    }
}
