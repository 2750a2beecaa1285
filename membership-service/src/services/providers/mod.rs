//! Identity backend adapters.
//!
//! Every method returns an [`OperationResult`]; expected failures are never
//! signalled through panics or `Result`. Adapters are not wrapped by anything
//! here: the registry puts each one behind a [`GuardedProvider`].

pub mod guarded;
pub mod memory;
pub mod registry;
pub mod scim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{MembershipAction, OperationResult};

pub use guarded::GuardedProvider;
pub use memory::InMemoryProvider;
pub use registry::{ProviderRegistry, ProviderRegistryBuilder, RegistryError};
pub use scim::ScimProvider;

/// Fixed at registration; never changes while the provider takes traffic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderCapabilities {
    pub supports_user_creation: bool,
    pub supports_group_creation: bool,
    pub supports_member_management: bool,
    pub supports_batch_operations: bool,
    pub supports_role_reporting: bool,
    pub is_primary: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_user_creation: false,
            supports_group_creation: false,
            supports_member_management: true,
            supports_batch_operations: false,
            supports_role_reporting: false,
            is_primary: false,
        }
    }
}

impl ProviderCapabilities {
    pub fn primary() -> Self {
        Self {
            is_primary: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait GroupProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    async fn add_member(
        &self,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult;

    async fn remove_member(
        &self,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult;

    /// `data` carries `OperationData::Members` on success.
    async fn get_group_members(&self, group_key: &str) -> OperationResult;

    /// `data` carries `OperationData::Groups` on success.
    async fn list_groups(&self) -> OperationResult;

    /// `data` carries `OperationData::Permission` on success.
    async fn validate_permissions(
        &self,
        user_key: &str,
        group_key: &str,
        action: MembershipAction,
    ) -> OperationResult;

    /// Backends that track member roles expose them through [`RoleReporter`].
    fn as_role_reporter(&self) -> Option<&dyn RoleReporter> {
        None
    }
}

#[async_trait]
pub trait RoleReporter: Send + Sync {
    /// `data` carries `OperationData::Roles` keyed by member email.
    async fn get_member_roles(&self, group_key: &str) -> OperationResult;
}
