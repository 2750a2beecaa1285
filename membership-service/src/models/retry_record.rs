use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::operation::OperationStatus;

/// Write replayed against a provider. Closed set: the worker's replay is exhaustive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    AddMember,
    RemoveMember,
}

impl MembershipAction {
    /// Whether `status` means the backend already reflects the intended end state.
    ///
    /// A removal that reports NOT_FOUND is done: the member is absent either way.
    pub fn is_terminal(self, status: OperationStatus) -> bool {
        match (self, status) {
            (_, OperationStatus::Success) => true,
            (MembershipAction::RemoveMember, OperationStatus::NotFound) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MembershipAction::AddMember => "add_member",
            MembershipAction::RemoveMember => "remove_member",
        }
    }
}

impl std::fmt::Display for MembershipAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    MembershipPropagation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    DeadLetter,
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordState::Pending => write!(f, "pending"),
            RecordState::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPayload {
    pub group_id: String,
    pub provider: String,
    pub action: MembershipAction,
    pub member_email: String,
    pub correlation_id: String,
}

/// Durable unit of pending propagation work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub operation_type: OperationType,
    pub payload: RetryPayload,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub next_retry_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub state: RecordState,
    /// Set once dead-lettered; the durable store expires the record after this instant.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

// Helper module for optional DateTime<Utc> as BSON DateTime
mod opt_chrono_datetime_as_bson_datetime {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(dt) => bson::DateTime::from_chrono(*dt).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<bson::DateTime> = Option::deserialize(deserializer)?;
        Ok(opt.map(|dt| dt.to_chrono()))
    }
}

impl RetryRecord {
    /// A fresh record, due immediately, with no attempts recorded.
    pub fn new(payload: RetryPayload) -> Self {
        // BSON stores milliseconds; truncate so a stored record compares equal to this one.
        let now = truncate_to_millis(Utc::now());
        Self {
            id: Uuid::new_v4().to_string(),
            operation_type: OperationType::MembershipPropagation,
            payload,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            next_retry_at: now,
            claimed_by: None,
            lease_expires_at: None,
            state: RecordState::Pending,
            expires_at: None,
        }
    }

    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn is_dead_letter(&self) -> bool {
        self.state == RecordState::DeadLetter
    }

    /// No lease, or the lease has lapsed.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Pending && self.lease_expires_at.map_or(true, |at| at <= now)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at <= now && self.is_claimable_at(now)
    }

    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Pending && self.lease_expires_at.is_some_and(|at| at > now)
    }

    pub fn set_lease(&mut self, worker_id: &str, lease: Duration, now: DateTime<Utc>) {
        self.claimed_by = Some(worker_id.to_string());
        self.lease_expires_at = Some(truncate_to_millis(now + lease));
    }

    pub fn clear_lease(&mut self) {
        self.claimed_by = None;
        self.lease_expires_at = None;
    }
}

pub(crate) fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// What `increment_attempt` did with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Rescheduled {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
}

impl AttemptOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            AttemptOutcome::Rescheduled { attempts, .. } => *attempts,
            AttemptOutcome::DeadLettered { attempts } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryStats {
    /// Pending records not currently leased.
    pub pending: u64,
    /// Pending records held under a live lease.
    pub leased: u64,
    pub dead_letter: u64,
    pub total: u64,
}
