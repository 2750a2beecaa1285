use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{GroupProvider, ProviderCapabilities};
use crate::models::{error_codes, MembershipAction, OperationResult, OperationStatus};
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::services::metrics;

/// A provider behind its circuit breaker and per-call timeout.
///
/// This is the only handle the orchestrator and the reconciliation worker use,
/// so every call that reaches a backend is accounted for by the breaker.
pub struct GuardedProvider {
    inner: Arc<dyn GroupProvider>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
    capabilities: ProviderCapabilities,
}

impl GuardedProvider {
    pub fn new(
        inner: Arc<dyn GroupProvider>,
        breaker_config: CircuitBreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        let capabilities = inner.capabilities();
        let breaker = CircuitBreaker::new(inner.name(), breaker_config);
        Self {
            inner,
            breaker,
            call_timeout,
            capabilities,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    pub fn is_primary(&self) -> bool {
        self.capabilities.is_primary
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn inner(&self) -> &Arc<dyn GroupProvider> {
        &self.inner
    }

    pub async fn apply(
        &self,
        action: MembershipAction,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult {
        match action {
            MembershipAction::AddMember => self.add_member(group_key, member, justification).await,
            MembershipAction::RemoveMember => {
                self.remove_member(group_key, member, justification).await
            }
        }
    }

    pub async fn add_member(
        &self,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult {
        self.call("add_member", || {
            self.inner.add_member(group_key, member, justification)
        })
        .await
    }

    pub async fn remove_member(
        &self,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult {
        self.call("remove_member", || {
            self.inner.remove_member(group_key, member, justification)
        })
        .await
    }

    pub async fn get_group_members(&self, group_key: &str) -> OperationResult {
        self.call("get_group_members", || self.inner.get_group_members(group_key))
            .await
    }

    pub async fn list_groups(&self) -> OperationResult {
        self.call("list_groups", || self.inner.list_groups()).await
    }

    pub async fn validate_permissions(
        &self,
        user_key: &str,
        group_key: &str,
        action: MembershipAction,
    ) -> OperationResult {
        self.call("validate_permissions", || {
            self.inner.validate_permissions(user_key, group_key, action)
        })
        .await
    }

    /// Member roles, for backends that report them. Goes through the breaker like any call.
    pub async fn get_member_roles(&self, group_key: &str) -> OperationResult {
        match self.inner.as_role_reporter() {
            Some(reporter) => {
                self.call("get_member_roles", || reporter.get_member_roles(group_key))
                    .await
            }
            None => OperationResult::permanent(format!(
                "provider {} does not report member roles",
                self.name()
            ))
            .with_error_code(error_codes::INVALID_REQUEST),
        }
    }

    async fn call<F, Fut>(&self, operation: &'static str, f: F) -> OperationResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OperationResult> + Send,
    {
        // Held across the await: a cancelled half-open trial reopens the breaker on drop.
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                metrics::record_short_circuit(self.name(), operation);
                tracing::debug!(
                    provider = %self.name(),
                    operation,
                    "Circuit open, call short-circuited"
                );
                return OperationResult::transient(format!(
                    "circuit breaker open for provider {}",
                    self.name()
                ))
                .with_error_code(error_codes::CIRCUIT_OPEN)
                .with_retry_after(open.retry_after.as_secs().max(1));
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.call_timeout, AssertUnwindSafe(f()).catch_unwind())
            .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    provider = %self.name(),
                    operation,
                    panic = %detail,
                    "Provider call panicked"
                );
                OperationResult::transient(format!("unexpected provider fault: {}", detail))
                    .with_error_code(error_codes::UNEXPECTED_FAULT)
            }
            Err(_) => {
                tracing::warn!(
                    provider = %self.name(),
                    operation,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Provider call timed out"
                );
                OperationResult::transient(format!(
                    "provider {} did not answer within {}ms",
                    self.name(),
                    self.call_timeout.as_millis()
                ))
                .with_error_code(error_codes::TIMEOUT)
            }
        };

        // NOT_FOUND, PERMANENT_ERROR and a truncated listing mean the backend
        // answered; only other transient failures count against its health.
        let unhealthy = result.status == OperationStatus::TransientError
            && result.error_code.as_deref() != Some(error_codes::INCOMPLETE_LISTING);
        if unhealthy {
            permit.failed();
        } else {
            permit.succeeded();
        }

        metrics::record_provider_call(
            self.name(),
            operation,
            &result.status.to_string(),
            started.elapsed(),
        );

        result
    }
}

impl std::fmt::Debug for GuardedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedProvider")
            .field("name", &self.name())
            .field("capabilities", &self.capabilities)
            .field("breaker_state", &self.breaker.state())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}
