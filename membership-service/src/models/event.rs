use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::retry_record::MembershipAction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MembershipEventType {
    #[serde(rename = "group.member.added")]
    MemberAdded,
    #[serde(rename = "group.member.removed")]
    MemberRemoved,
}

impl MembershipEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            MembershipEventType::MemberAdded => "group.member.added",
            MembershipEventType::MemberRemoved => "group.member.removed",
        }
    }
}

impl std::fmt::Display for MembershipEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MembershipAction> for MembershipEventType {
    fn from(action: MembershipAction) -> Self {
        match action {
            MembershipAction::AddMember => MembershipEventType::MemberAdded,
            MembershipAction::RemoveMember => MembershipEventType::MemberRemoved,
        }
    }
}

/// Domain event emitted after an authoritative write lands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MembershipEvent {
    pub event_type: MembershipEventType,
    pub group_id: String,
    pub member_email: String,
    pub provider: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl MembershipEvent {
    pub fn new(
        action: MembershipAction,
        group_id: impl Into<String>,
        member_email: impl Into<String>,
        provider: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: action.into(),
            group_id: group_id.into(),
            member_email: member_email.into(),
            provider: provider.into(),
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
        }
    }
}
