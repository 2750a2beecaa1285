use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use service_core::error::AppError;

use super::{RetryPolicy, RetryStore};
use crate::models::{AttemptOutcome, RecordState, RetryRecord, RetryStats};

/// Process-local store. Records do not survive a restart.
///
/// Each DashMap entry is locked for the duration of a mutation, which is what
/// makes `claim_record` a compare-and-set.
pub struct InMemoryRetryStore {
    records: DashMap<String, RetryRecord>,
    policy: RetryPolicy,
}

impl InMemoryRetryStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            records: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record currently held, in no particular order.
    pub fn snapshot(&self) -> Vec<RetryRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Drop dead-lettered records whose retention has lapsed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.records.len();
        self.records
            .retain(|_, r| !(r.is_dead_letter() && r.expires_at.is_some_and(|at| at <= now)));
        before - self.records.len()
    }
}

impl Default for InMemoryRetryStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, record: RetryRecord) -> Result<String, AppError> {
        let id = record.id.clone();
        if self.records.contains_key(&id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "retry record {} already exists",
                id
            )));
        }
        tracing::debug!(
            record_id = %id,
            provider = %record.payload.provider,
            action = %record.payload.action,
            "Retry record enqueued"
        );
        self.records.insert(id.clone(), record);
        Ok(id)
    }

    async fn fetch_due(&self, limit: usize) -> Result<Vec<RetryRecord>, AppError> {
        self.purge_expired();
        let now = Utc::now();
        let mut due: Vec<RetryRecord> = self
            .records
            .iter()
            .filter(|r| r.is_due_at(now))
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|r| r.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_record(
        &self,
        id: &str,
        worker_id: &str,
        lease_seconds: u64,
    ) -> Result<bool, AppError> {
        let Some(mut record) = self.records.get_mut(id) else {
            return Ok(false);
        };
        let now = Utc::now();
        let held_by_other = record.is_leased_at(now)
            && record.claimed_by.as_deref() != Some(worker_id);
        if record.state != RecordState::Pending || held_by_other {
            return Ok(false);
        }
        let lease = Duration::seconds(i64::try_from(lease_seconds).unwrap_or(i64::MAX / 1000));
        record.set_lease(worker_id, lease, now);
        Ok(true)
    }

    async fn mark_success(&self, id: &str) -> Result<(), AppError> {
        if self.records.remove(id).is_some() {
            tracing::debug!(record_id = %id, "Retry record completed");
        }
        Ok(())
    }

    async fn increment_attempt(
        &self,
        id: &str,
        last_error: &str,
    ) -> Result<AttemptOutcome, AppError> {
        let mut record = self.records.get_mut(id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("retry record {} not found", id))
        })?;
        Ok(self
            .policy
            .register_failure(record.value_mut(), last_error, Utc::now()))
    }

    async fn get_stats(&self) -> Result<RetryStats, AppError> {
        let now = Utc::now();
        let mut stats = RetryStats::default();
        for record in self.records.iter() {
            stats.total += 1;
            if record.is_dead_letter() {
                stats.dead_letter += 1;
            } else if record.is_leased_at(now) {
                stats.leased += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }

    async fn get(&self, id: &str) -> Result<Option<RetryRecord>, AppError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<RetryRecord>, AppError> {
        let mut found: Vec<RetryRecord> = self
            .records
            .iter()
            .filter(|r| r.payload.correlation_id == correlation_id)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<RetryRecord>, AppError> {
        let mut dead: Vec<RetryRecord> = self
            .records
            .iter()
            .filter(|r| r.is_dead_letter())
            .map(|r| r.value().clone())
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        dead.truncate(limit);
        Ok(dead)
    }
}
