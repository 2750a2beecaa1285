use super::group::{NormalizedGroup, NormalizedMember};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Machine-readable codes attached to non-success results.
pub mod error_codes {
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UNEXPECTED_FAULT: &str = "UNEXPECTED_FAULT";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const GROUP_NOT_FOUND: &str = "GROUP_NOT_FOUND";
    pub const MEMBER_NOT_FOUND: &str = "MEMBER_NOT_FOUND";
    pub const NO_PRIMARY_PROVIDER: &str = "NO_PRIMARY_PROVIDER";
    pub const AMBIGUOUS_PRIMARY: &str = "AMBIGUOUS_PRIMARY";
    pub const PROVIDER_NOT_REGISTERED: &str = "PROVIDER_NOT_REGISTERED";
    pub const BACKEND_UNAVAILABLE: &str = "BACKEND_UNAVAILABLE";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const QUEUE_FAILURE: &str = "QUEUE_FAILURE";
    pub const INCOMPLETE_LISTING: &str = "INCOMPLETE_LISTING";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Success,
    NotFound,
    TransientError,
    PermanentError,
}

impl OperationStatus {
    pub fn is_success(self) -> bool {
        self == OperationStatus::Success
    }

    /// Only transient failures are worth replaying unchanged.
    pub fn is_retryable(self) -> bool {
        self == OperationStatus::TransientError
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Success => write!(f, "SUCCESS"),
            OperationStatus::NotFound => write!(f, "NOT_FOUND"),
            OperationStatus::TransientError => write!(f, "TRANSIENT_ERROR"),
            OperationStatus::PermanentError => write!(f, "PERMANENT_ERROR"),
        }
    }
}

/// Typed payload carried by a successful read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OperationData {
    Members(Vec<NormalizedMember>),
    Groups(Vec<NormalizedGroup>),
    Permission { allowed: bool },
    Roles(HashMap<String, String>),
}

/// Uniform outcome of every provider and orchestration call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OperationData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Seconds the backend asked us to wait before trying again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl OperationResult {
    fn with_status(status: OperationStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
            error_code: None,
            retry_after: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(OperationStatus::Success, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_status(OperationStatus::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::with_status(OperationStatus::TransientError, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::with_status(OperationStatus::PermanentError, message)
    }

    pub fn with_data(mut self, data: OperationData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn members(&self) -> Option<&[NormalizedMember]> {
        match &self.data {
            Some(OperationData::Members(members)) => Some(members),
            _ => None,
        }
    }

    pub fn groups(&self) -> Option<&[NormalizedGroup]> {
        match &self.data {
            Some(OperationData::Groups(groups)) => Some(groups),
            _ => None,
        }
    }

    pub fn allowed(&self) -> Option<bool> {
        match &self.data {
            Some(OperationData::Permission { allowed }) => Some(*allowed),
            _ => None,
        }
    }

    /// Short form used as `last_error` on retry records.
    pub fn summary(&self) -> String {
        match &self.error_code {
            Some(code) => format!("{} [{}]: {}", self.status, code, self.message),
            None => format!("{}: {}", self.status, self.message),
        }
    }
}
