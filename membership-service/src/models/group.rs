use serde::{Deserialize, Serialize};

/// Provider-agnostic view of one group member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedMember {
    pub email: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_member_id: Option<String>,
    /// Backend record as received, for adapters that need more than the normalized fields.
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

impl NormalizedMember {
    pub fn new(email: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            id: id.into(),
            role: None,
            provider_member_id: None,
            raw_payload: serde_json::Value::Null,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_provider_member_id(mut self, id: impl Into<String>) -> Self {
        self.provider_member_id = Some(id.into());
        self
    }

    pub fn with_raw_payload(mut self, payload: serde_json::Value) -> Self {
        self.raw_payload = payload;
        self
    }
}

/// One backend's copy of a logical group. Never merged across providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedGroup {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub provider_name: String,
    #[serde(default)]
    pub members: Vec<NormalizedMember>,
}

impl NormalizedGroup {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            provider_name: provider_name.into(),
            members: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn has_member(&self, email: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.email.eq_ignore_ascii_case(email))
    }
}
