use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{GroupProvider, ProviderCapabilities, RoleReporter};
use crate::models::{
    error_codes, MembershipAction, NormalizedGroup, NormalizedMember, OperationData,
    OperationResult,
};

#[derive(Debug, Clone)]
struct WriteFault {
    result: OperationResult,
    /// `None` fails every write until cleared.
    remaining: Option<u32>,
}

/// Backend held entirely in process memory.
///
/// Used for local development and tests. Writes can be scripted to fail,
/// stall or panic, and reads to fail, so callers can exercise their failure
/// handling.
pub struct InMemoryProvider {
    name: String,
    capabilities: ProviderCapabilities,
    groups: Mutex<BTreeMap<String, NormalizedGroup>>,
    write_fault: Mutex<Option<WriteFault>>,
    read_fault: Mutex<Option<OperationResult>>,
    latency: Mutex<Option<Duration>>,
    panic_on_writes: AtomicBool,
    write_calls: AtomicU64,
    read_calls: AtomicU64,
}

impl InMemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: ProviderCapabilities::default(),
            groups: Mutex::new(BTreeMap::new()),
            write_fault: Mutex::new(None),
            read_fault: Mutex::new(None),
            latency: Mutex::new(None),
            panic_on_writes: AtomicBool::new(false),
            write_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn primary(mut self) -> Self {
        self.capabilities.is_primary = true;
        self
    }

    pub fn with_role_reporting(mut self) -> Self {
        self.capabilities.supports_role_reporting = true;
        self
    }

    pub fn with_group(self, id: &str, name: &str) -> Self {
        let group = NormalizedGroup::new(id, name, self.name.clone());
        lock(&self.groups).insert(id.to_string(), group);
        self
    }

    pub fn with_member(self, group_id: &str, email: &str) -> Self {
        if let Some(group) = lock(&self.groups).get_mut(group_id) {
            group.members.push(member_record(email, "member"));
        }
        self
    }

    /// Every subsequent write returns `result` until [`clear_faults`](Self::clear_faults).
    pub fn fail_writes_with(&self, result: OperationResult) {
        *lock(&self.write_fault) = Some(WriteFault {
            result,
            remaining: None,
        });
    }

    /// The next `times` writes return `result`, later writes behave normally.
    pub fn fail_next_writes(&self, result: OperationResult, times: u32) {
        *lock(&self.write_fault) = Some(WriteFault {
            result,
            remaining: Some(times),
        });
    }

    /// Group listings and member reads return `result` until cleared.
    pub fn fail_reads_with(&self, result: OperationResult) {
        *lock(&self.read_fault) = Some(result);
    }

    pub fn clear_faults(&self) {
        *lock(&self.write_fault) = None;
        *lock(&self.read_fault) = None;
        *lock(&self.latency) = None;
        self.panic_on_writes.store(false, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    pub fn panic_on_writes(&self, enabled: bool) {
        self.panic_on_writes.store(enabled, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn members_of(&self, group_id: &str) -> Vec<String> {
        lock(&self.groups)
            .get(group_id)
            .map(|g| g.members.iter().map(|m| m.email.clone()).collect())
            .unwrap_or_default()
    }

    async fn before_call(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn before_read(&self) -> Option<OperationResult> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await;
        lock(&self.read_fault).clone()
    }

    async fn before_write(&self) -> Option<OperationResult> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await;

        if self.panic_on_writes.load(Ordering::SeqCst) {
            panic!("in-memory provider {} configured to panic", self.name);
        }

        let mut fault = lock(&self.write_fault);
        let injected = fault.as_ref().map(|f| f.result.clone());
        let exhausted = match fault.as_mut() {
            Some(WriteFault {
                remaining: Some(remaining),
                ..
            }) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            _ => false,
        };
        if exhausted {
            *fault = None;
        }
        injected
    }
}

fn member_record(email: &str, role: &str) -> NormalizedMember {
    NormalizedMember::new(email, email)
        .with_role(role)
        .with_provider_member_id(email)
        .with_raw_payload(serde_json::json!({ "email": email, "role": role }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl GroupProvider for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn add_member(
        &self,
        group_key: &str,
        member: &str,
        _justification: Option<&str>,
    ) -> OperationResult {
        if let Some(result) = self.before_write().await {
            return result;
        }

        let mut groups = lock(&self.groups);
        let Some(group) = groups.get_mut(group_key) else {
            return OperationResult::not_found(format!("group {} does not exist", group_key))
                .with_error_code(error_codes::GROUP_NOT_FOUND);
        };

        if group.has_member(member) {
            return OperationResult::success(format!(
                "{} is already a member of {}",
                member, group_key
            ));
        }

        group.members.push(member_record(member, "member"));
        tracing::debug!(provider = %self.name, group_id = group_key, member, "Member added");
        OperationResult::success(format!("added {} to {}", member, group_key))
    }

    async fn remove_member(
        &self,
        group_key: &str,
        member: &str,
        _justification: Option<&str>,
    ) -> OperationResult {
        if let Some(result) = self.before_write().await {
            return result;
        }

        let mut groups = lock(&self.groups);
        let Some(group) = groups.get_mut(group_key) else {
            return OperationResult::not_found(format!("group {} does not exist", group_key))
                .with_error_code(error_codes::GROUP_NOT_FOUND);
        };

        let before = group.members.len();
        group
            .members
            .retain(|m| !m.email.eq_ignore_ascii_case(member));
        if group.members.len() == before {
            return OperationResult::not_found(format!(
                "{} is not a member of {}",
                member, group_key
            ))
            .with_error_code(error_codes::MEMBER_NOT_FOUND);
        }

        tracing::debug!(provider = %self.name, group_id = group_key, member, "Member removed");
        OperationResult::success(format!("removed {} from {}", member, group_key))
    }

    async fn get_group_members(&self, group_key: &str) -> OperationResult {
        if let Some(fault) = self.before_read().await {
            return fault;
        }

        match lock(&self.groups).get(group_key) {
            Some(group) => OperationResult::success(format!(
                "{} members in {}",
                group.members.len(),
                group_key
            ))
            .with_data(OperationData::Members(group.members.clone())),
            None => OperationResult::not_found(format!("group {} does not exist", group_key))
                .with_error_code(error_codes::GROUP_NOT_FOUND),
        }
    }

    async fn list_groups(&self) -> OperationResult {
        if let Some(fault) = self.before_read().await {
            return fault;
        }

        let groups: Vec<NormalizedGroup> = lock(&self.groups).values().cloned().collect();
        OperationResult::success(format!("{} groups", groups.len()))
            .with_data(OperationData::Groups(groups))
    }

    async fn validate_permissions(
        &self,
        user_key: &str,
        group_key: &str,
        action: MembershipAction,
    ) -> OperationResult {
        self.read_calls.fetch_add(1, Ordering::SeqCst);

        let groups = lock(&self.groups);
        let Some(group) = groups.get(group_key) else {
            return OperationResult::not_found(format!("group {} does not exist", group_key))
                .with_error_code(error_codes::GROUP_NOT_FOUND);
        };

        // Owners manage membership; anyone may remove themselves.
        let allowed = group.members.iter().any(|m| {
            m.email.eq_ignore_ascii_case(user_key) && m.role.as_deref() == Some("owner")
        }) || (action == MembershipAction::RemoveMember && group.has_member(user_key));

        OperationResult::success(format!("{} may {}: {}", user_key, action, allowed))
            .with_data(OperationData::Permission { allowed })
    }

    fn as_role_reporter(&self) -> Option<&dyn RoleReporter> {
        if self.capabilities.supports_role_reporting {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl RoleReporter for InMemoryProvider {
    async fn get_member_roles(&self, group_key: &str) -> OperationResult {
        match lock(&self.groups).get(group_key) {
            Some(group) => {
                let roles: HashMap<String, String> = group
                    .members
                    .iter()
                    .map(|m| (m.email.clone(), m.role.clone().unwrap_or_default()))
                    .collect();
                OperationResult::success(format!("{} roles", roles.len()))
                    .with_data(OperationData::Roles(roles))
            }
            None => OperationResult::not_found(format!("group {} does not exist", group_key))
                .with_error_code(error_codes::GROUP_NOT_FOUND),
        }
    }
}
