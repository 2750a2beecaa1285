//! Durable queue of propagation attempts awaiting replay.
//!
//! Two interchangeable backends: [`InMemoryRetryStore`] for a single process
//! and [`MongoRetryStore`] for deployments with several worker instances.
//! Exclusive processing rests entirely on `claim_record` being an atomic
//! compare-and-set on the lease.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use service_core::error::AppError;

use crate::models::retry_record::truncate_to_millis;
use crate::models::{AttemptOutcome, RecordState, RetryRecord, RetryStats};

pub use memory::InMemoryRetryStore;
pub use mongo::MongoRetryStore;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    /// How long dead-lettered records are kept before expiring.
    pub dead_letter_retention_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_seconds: 60,
            max_delay_seconds: 3600,
            dead_letter_retention_seconds: 7 * 24 * 3600,
        }
    }
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^attempts)`, saturating instead of overflowing.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
        let seconds = self
            .base_delay_seconds
            .saturating_mul(factor)
            .min(self.max_delay_seconds);
        Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX / 1000))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn retention(&self) -> Duration {
        Duration::seconds(i64::try_from(self.dead_letter_retention_seconds).unwrap_or(i64::MAX / 1000))
    }

    /// Record one failed attempt on `record`.
    ///
    /// `attempts` only ever grows; the lease is released; the record is either
    /// rescheduled with backoff or moved to dead-letter once the budget is spent.
    pub fn register_failure(
        &self,
        record: &mut RetryRecord,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        let now = truncate_to_millis(now);
        record.attempts = record.attempts.saturating_add(1);
        record.last_error = Some(last_error.to_string());
        record.updated_at = now;
        record.clear_lease();

        if self.is_exhausted(record.attempts) {
            record.state = RecordState::DeadLetter;
            record.next_retry_at = now;
            record.expires_at = Some(now + self.retention());
            AttemptOutcome::DeadLettered {
                attempts: record.attempts,
            }
        } else {
            record.next_retry_at = now + self.backoff_delay(record.attempts);
            AttemptOutcome::Rescheduled {
                attempts: record.attempts,
                next_retry_at: record.next_retry_at,
            }
        }
    }
}

#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Short backend label for logs and health output.
    fn backend_name(&self) -> &'static str;

    async fn enqueue(&self, record: RetryRecord) -> Result<String, AppError>;

    /// Pending records with `next_retry_at <= now` and no live lease, oldest first.
    async fn fetch_due(&self, limit: usize) -> Result<Vec<RetryRecord>, AppError>;

    /// Atomically take the lease on `id`. `false` if someone else holds a live lease.
    async fn claim_record(
        &self,
        id: &str,
        worker_id: &str,
        lease_seconds: u64,
    ) -> Result<bool, AppError>;

    /// The propagation landed; the record is deleted.
    async fn mark_success(&self, id: &str) -> Result<(), AppError>;

    async fn increment_attempt(&self, id: &str, last_error: &str)
        -> Result<AttemptOutcome, AppError>;

    async fn get_stats(&self) -> Result<RetryStats, AppError>;

    async fn get(&self, id: &str) -> Result<Option<RetryRecord>, AppError>;

    /// Every record, pending or dead-lettered, created for one orchestration call.
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<RetryRecord>, AppError>;

    /// Most recently dead-lettered first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<RetryRecord>, AppError>;

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MembershipAction, RetryPayload};

    fn record() -> RetryRecord {
        RetryRecord::new(RetryPayload {
            group_id: "eng".to_string(),
            provider: "cloud".to_string(),
            action: MembershipAction::AddMember,
            member_email: "ada@example.com".to_string(),
            correlation_id: "corr-1".to_string(),
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_seconds: 10,
            max_delay_seconds: 100,
            ..Default::default()
        };
        assert_eq!(policy.backoff_delay(0), Duration::seconds(10));
        assert_eq!(policy.backoff_delay(1), Duration::seconds(20));
        assert_eq!(policy.backoff_delay(3), Duration::seconds(80));
        assert_eq!(policy.backoff_delay(4), Duration::seconds(100));
        assert_eq!(policy.backoff_delay(200), Duration::seconds(100));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::zero();
        for attempts in 0..80 {
            let delay = policy.backoff_delay(attempts);
            assert!(delay >= previous);
            assert!(delay <= Duration::seconds(policy.max_delay_seconds as i64));
            previous = delay;
        }
    }

    #[test]
    fn failure_reschedules_after_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_seconds: 5,
            max_delay_seconds: 60,
            ..Default::default()
        };
        let mut record = record();
        record.set_lease("worker-a", Duration::seconds(30), Utc::now());
        let now = Utc::now();

        let outcome = policy.register_failure(&mut record, "TRANSIENT_ERROR: down", now);

        assert_eq!(outcome.attempts(), 1);
        assert!(matches!(outcome, AttemptOutcome::Rescheduled { .. }));
        assert_eq!(record.next_retry_at - record.updated_at, Duration::seconds(10));
        assert!(record.claimed_by.is_none());
        assert!(record.lease_expires_at.is_none());
    }

    #[test]
    fn exhausted_budget_dead_letters() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let mut record = record();
        let now = Utc::now();

        policy.register_failure(&mut record, "first", now);
        let outcome = policy.register_failure(&mut record, "second", now);

        assert_eq!(outcome, AttemptOutcome::DeadLettered { attempts: 2 });
        assert!(record.is_dead_letter());
        assert!(record.next_retry_at >= record.updated_at);
        assert!(record.expires_at.unwrap() > record.updated_at);
        assert_eq!(record.last_error.as_deref(), Some("second"));
    }
}
