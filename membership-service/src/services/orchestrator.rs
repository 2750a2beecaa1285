//! Entry point for membership writes.
//!
//! The primary provider is written synchronously and alone decides the
//! outcome. Every other provider that defines the group is written on the
//! propagation pool; writes that do not land become retry records for the
//! reconciliation worker.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    error_codes, MembershipAction, MembershipEvent, OperationResult, OperationStatus,
    RetryPayload, RetryRecord,
};
use crate::services::events::EventPublisher;
use crate::services::metrics;
use crate::services::providers::{GuardedProvider, ProviderRegistry};
use crate::services::retry_store::RetryStore;
use crate::workers::PropagationPool;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MembershipRequest {
    #[validate(length(min = 1, max = 256))]
    pub group_id: String,
    #[validate(email)]
    pub member_email: String,
    /// Forces this provider to act as primary for the call.
    #[serde(default)]
    pub provider_hint: Option<String>,
    #[serde(default)]
    #[validate(length(max = 1024))]
    pub justification: Option<String>,
    /// Generated when absent.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl MembershipRequest {
    pub fn new(group_id: impl Into<String>, member_email: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            member_email: member_email.into(),
            provider_hint: None,
            justification: None,
            correlation_id: None,
        }
    }

    pub fn with_provider_hint(mut self, provider: impl Into<String>) -> Self {
        self.provider_hint = Some(provider.into());
        self
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Outcome of one orchestrated write.
///
/// `success` reflects the primary write only. `partial_failures` is set when
/// any secondary did not reach the intended state; those appear in
/// `propagation` and, when queued, in `retry_record_ids`. Providers whose
/// group listing was refused outright are named in `skipped_providers`; they
/// were not written and nothing was queued for them.
#[derive(Debug, Clone, Serialize)]
pub struct MembershipResponse {
    pub success: bool,
    pub correlation_id: String,
    pub action: MembershipAction,
    pub group_id: String,
    pub member_email: String,
    pub primary_provider: Option<String>,
    pub primary: OperationResult,
    pub propagation: BTreeMap<String, OperationResult>,
    pub partial_failures: bool,
    pub retry_record_ids: Vec<String>,
    pub skipped_providers: Vec<String>,
}

impl MembershipResponse {
    fn rejected(
        action: MembershipAction,
        request: &MembershipRequest,
        correlation_id: String,
        primary_provider: Option<String>,
        result: OperationResult,
    ) -> Self {
        Self {
            success: false,
            correlation_id,
            action,
            group_id: request.group_id.clone(),
            member_email: request.member_email.clone(),
            primary_provider,
            primary: result,
            propagation: BTreeMap::new(),
            partial_failures: false,
            retry_record_ids: Vec::new(),
            skipped_providers: Vec::new(),
        }
    }

    /// The primary write landed and every secondary matches it.
    pub fn is_fully_consistent(&self) -> bool {
        self.success && !self.partial_failures
    }
}

/// Providers chosen for one write.
#[derive(Debug, Clone)]
pub struct ProviderResolution {
    pub primary: Arc<GuardedProvider>,
    pub secondaries: Vec<Arc<GuardedProvider>>,
    /// Providers whose group listing failed transiently. They are written as
    /// secondaries so the write is not lost if they do define the group.
    pub unreachable: Vec<String>,
    /// Providers whose group listing failed permanently. Whether they define
    /// the group is unknown, so they are left out of the write.
    pub skipped: Vec<String>,
}

struct PropagationOutcome {
    result: OperationResult,
    record_id: Option<String>,
}

pub struct MembershipOrchestrator {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn RetryStore>,
    pool: PropagationPool,
    events: Arc<dyn EventPublisher>,
}

impl MembershipOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn RetryStore>,
        pool: PropagationPool,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            registry,
            store,
            pool,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub async fn add_member(&self, request: MembershipRequest) -> MembershipResponse {
        self.execute(MembershipAction::AddMember, request).await
    }

    pub async fn remove_member(&self, request: MembershipRequest) -> MembershipResponse {
        self.execute(MembershipAction::RemoveMember, request).await
    }

    /// Retry records still outstanding (or dead-lettered) for one orchestrated write.
    pub async fn pending_reconciliation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<RetryRecord>, AppError> {
        self.store.find_by_correlation_id(correlation_id).await
    }

    #[tracing::instrument(
        name = "membership.execute",
        skip_all,
        fields(
            action = %action,
            group_id = %request.group_id,
            correlation_id = tracing::field::Empty
        )
    )]
    pub async fn execute(
        &self,
        action: MembershipAction,
        request: MembershipRequest,
    ) -> MembershipResponse {
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        if let Err(e) = request.validate() {
            tracing::info!(error = %e, "Membership request rejected");
            metrics::record_membership_operation(action.as_str(), "rejected");
            let result = OperationResult::permanent(format!("invalid request: {}", e))
                .with_error_code(error_codes::VALIDATION_ERROR);
            return MembershipResponse::rejected(action, &request, correlation_id, None, result);
        }

        let resolution = match self
            .resolve_providers(&request.group_id, request.provider_hint.as_deref())
            .await
        {
            Ok(resolution) => resolution,
            Err(result) => {
                tracing::info!(result = %result.summary(), "No primary provider for group");
                metrics::record_membership_operation(action.as_str(), "rejected");
                return MembershipResponse::rejected(action, &request, correlation_id, None, result);
            }
        };

        let primary_name = resolution.primary.name().to_string();
        let justification = request.justification.as_deref();
        let primary = resolution
            .primary
            .apply(action, &request.group_id, &request.member_email, justification)
            .await;

        if !action.is_terminal(primary.status) {
            tracing::warn!(
                provider = %primary_name,
                result = %primary.summary(),
                "Primary write failed, nothing propagated"
            );
            metrics::record_membership_operation(action.as_str(), "failed");
            return MembershipResponse::rejected(
                action,
                &request,
                correlation_id,
                Some(primary_name),
                primary,
            );
        }

        if primary.status == OperationStatus::Success {
            self.publish_event(MembershipEvent::new(
                action,
                request.group_id.clone(),
                request.member_email.clone(),
                primary_name.clone(),
                correlation_id.clone(),
            ));
        }

        let mut propagation = BTreeMap::new();
        let mut retry_record_ids = Vec::new();
        let mut partial_failures = false;

        let outcomes = self
            .propagate(action, &request, &correlation_id, &resolution.secondaries)
            .await;
        for (provider, outcome) in outcomes {
            if !action.is_terminal(outcome.result.status) {
                partial_failures = true;
            }
            if let Some(id) = outcome.record_id {
                retry_record_ids.push(id);
            }
            propagation.insert(provider, outcome.result);
        }

        let outcome = if partial_failures { "partial" } else { "succeeded" };
        metrics::record_membership_operation(action.as_str(), outcome);
        tracing::info!(
            provider = %primary_name,
            secondaries = propagation.len(),
            partial_failures,
            queued = retry_record_ids.len(),
            "Membership write completed"
        );

        MembershipResponse {
            success: true,
            correlation_id,
            action,
            group_id: request.group_id,
            member_email: request.member_email,
            primary_provider: Some(primary_name),
            primary,
            propagation,
            partial_failures,
            retry_record_ids,
            skipped_providers: resolution.skipped,
        }
    }

    /// Work out which providers define `group_id` and which of them is primary.
    ///
    /// A hint, when given, must name a registered provider that defines the group.
    /// Otherwise the single `is_primary` provider among those defining it wins;
    /// with none flagged, a group defined by exactly one provider uses that one.
    pub async fn resolve_providers(
        &self,
        group_id: &str,
        provider_hint: Option<&str>,
    ) -> Result<ProviderResolution, OperationResult> {
        if let Some(hint) = provider_hint {
            if self.registry.get(hint).is_none() {
                return Err(OperationResult::permanent(format!(
                    "provider {} is not registered",
                    hint
                ))
                .with_error_code(error_codes::PROVIDER_NOT_REGISTERED));
            }
        }

        let providers = self.registry.providers();
        let listings = join_all(providers.iter().map(|p| p.list_groups())).await;

        let mut defining = Vec::new();
        let mut unreachable = Vec::new();
        let mut skipped = Vec::new();
        for (provider, listing) in providers.iter().zip(listings) {
            match listing.status {
                OperationStatus::Success => {
                    let defines = listing
                        .groups()
                        .is_some_and(|groups| groups.iter().any(|g| g.id == group_id));
                    if defines {
                        defining.push(Arc::clone(provider));
                    }
                }
                OperationStatus::TransientError => {
                    tracing::warn!(
                        provider = %provider.name(),
                        result = %listing.summary(),
                        "Group listing unavailable, provider kept as candidate"
                    );
                    unreachable.push(Arc::clone(provider));
                }
                _ => {
                    tracing::warn!(
                        provider = %provider.name(),
                        group_id,
                        result = %listing.summary(),
                        "Group listing refused, provider skipped for this write"
                    );
                    skipped.push(provider.name().to_string());
                }
            }
        }

        let candidates: Vec<Arc<GuardedProvider>> =
            defining.iter().chain(unreachable.iter()).cloned().collect();

        let primary = match provider_hint {
            Some(hint) => candidates
                .iter()
                .find(|p| p.name() == hint)
                .cloned()
                .ok_or_else(|| group_not_found(group_id))?,
            None => {
                let flagged: Vec<&Arc<GuardedProvider>> =
                    candidates.iter().filter(|p| p.is_primary()).collect();
                match flagged.as_slice() {
                    [only] => Arc::clone(only),
                    [] => match (defining.as_slice(), unreachable.is_empty()) {
                        ([only], _) => Arc::clone(only),
                        ([], true) => return Err(group_not_found(group_id)),
                        ([], false) => {
                            return Err(OperationResult::transient(format!(
                                "providers for group {} could not be listed",
                                group_id
                            ))
                            .with_error_code(error_codes::BACKEND_UNAVAILABLE))
                        }
                        (_, _) => {
                            return Err(OperationResult::permanent(format!(
                                "group {} is defined by several providers and none is primary",
                                group_id
                            ))
                            .with_error_code(error_codes::NO_PRIMARY_PROVIDER))
                        }
                    },
                    many => {
                        let names: Vec<&str> = many.iter().map(|p| p.name()).collect();
                        return Err(OperationResult::permanent(format!(
                            "group {} has several primary providers: {}",
                            group_id,
                            names.join(", ")
                        ))
                        .with_error_code(error_codes::AMBIGUOUS_PRIMARY));
                    }
                }
            }
        };

        let secondaries = candidates
            .into_iter()
            .filter(|p| p.name() != primary.name())
            .collect();
        Ok(ProviderResolution {
            primary,
            secondaries,
            unreachable: unreachable.iter().map(|p| p.name().to_string()).collect(),
            skipped,
        })
    }

    /// Write every secondary on the pool and collect what happened.
    ///
    /// Each pool task enqueues its own retry record, so a dropped caller does
    /// not lose the write.
    async fn propagate(
        &self,
        action: MembershipAction,
        request: &MembershipRequest,
        correlation_id: &str,
        secondaries: &[Arc<GuardedProvider>],
    ) -> Vec<(String, PropagationOutcome)> {
        let mut pending = Vec::with_capacity(secondaries.len());
        for provider in secondaries {
            let payload = RetryPayload {
                group_id: request.group_id.clone(),
                provider: provider.name().to_string(),
                action,
                member_email: request.member_email.clone(),
                correlation_id: correlation_id.to_string(),
            };
            let task = propagate_one(
                Arc::clone(provider),
                Arc::clone(&self.store),
                payload.clone(),
                request.justification.clone(),
            );
            pending.push((payload, self.pool.spawn(task)));
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        let (payloads, handles): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        let joined = join_all(handles.into_iter().map(|handle| async move {
            match handle {
                Some(handle) => Some(handle.await),
                None => None,
            }
        }))
        .await;

        for (payload, joined) in payloads.into_iter().zip(joined) {
            let outcome = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(e)) => {
                    tracing::error!(
                        provider = %payload.provider,
                        error = %e,
                        "Propagation task aborted"
                    );
                    let result = OperationResult::transient(format!(
                        "propagation task aborted: {}",
                        e
                    ))
                    .with_error_code(error_codes::UNEXPECTED_FAULT);
                    enqueue_retry(self.store.as_ref(), payload.clone(), result).await
                }
                None => {
                    let result = OperationResult::transient(
                        "propagation pool unavailable, deferred to reconciliation",
                    )
                    .with_error_code(error_codes::BACKEND_UNAVAILABLE);
                    enqueue_retry(self.store.as_ref(), payload.clone(), result).await
                }
            };
            outcomes.push((payload.provider, outcome));
        }
        outcomes
    }

    fn publish_event(&self, event: MembershipEvent) {
        let events = Arc::clone(&self.events);
        let accepted = self.pool.spawn_detached(async move {
            let event_type = event.event_type;
            if let Err(e) = events.publish(event).await {
                tracing::warn!(
                    event_type = %event_type.as_str(),
                    error = %e,
                    "Failed to publish membership event"
                );
            }
        });
        if !accepted {
            tracing::warn!("Membership event dropped, propagation pool is shut down");
        }
    }
}

async fn propagate_one(
    provider: Arc<GuardedProvider>,
    store: Arc<dyn RetryStore>,
    payload: RetryPayload,
    justification: Option<String>,
) -> PropagationOutcome {
    let result = provider
        .apply(
            payload.action,
            &payload.group_id,
            &payload.member_email,
            justification.as_deref(),
        )
        .await;

    if payload.action.is_terminal(result.status) {
        tracing::debug!(provider = %payload.provider, "Secondary write applied");
        return PropagationOutcome {
            result,
            record_id: None,
        };
    }

    // Permanent failures are queued as well; replay will dead-letter them,
    // which leaves an auditable record.
    enqueue_retry(store.as_ref(), payload, result).await
}

async fn enqueue_retry(
    store: &dyn RetryStore,
    payload: RetryPayload,
    result: OperationResult,
) -> PropagationOutcome {
    let provider = payload.provider.clone();
    let action = payload.action;
    let record = RetryRecord::new(payload).with_last_error(result.summary());

    match store.enqueue(record).await {
        Ok(id) => {
            metrics::record_retry_enqueued(&provider, action.as_str());
            tracing::warn!(
                provider = %provider,
                record_id = %id,
                result = %result.summary(),
                "Secondary write failed, queued for reconciliation"
            );
            PropagationOutcome {
                result,
                record_id: Some(id),
            }
        }
        Err(e) => {
            tracing::error!(
                provider = %provider,
                error = %e,
                result = %result.summary(),
                "Secondary write failed and could not be queued"
            );
            PropagationOutcome {
                result: result.with_error_code(error_codes::QUEUE_FAILURE),
                record_id: None,
            }
        }
    }
}

fn group_not_found(group_id: &str) -> OperationResult {
    OperationResult::not_found(format!("no registered provider defines group {}", group_id))
        .with_error_code(error_codes::GROUP_NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::TracingEventPublisher;
    use crate::services::providers::InMemoryProvider;
    use crate::services::retry_store::InMemoryRetryStore;

    fn orchestrator(providers: Vec<Arc<InMemoryProvider>>) -> MembershipOrchestrator {
        let mut builder = ProviderRegistry::builder();
        for provider in providers {
            builder = builder.register(provider).unwrap();
        }
        MembershipOrchestrator::new(
            Arc::new(builder.build()),
            Arc::new(InMemoryRetryStore::default()),
            PropagationPool::new(4),
            Arc::new(TracingEventPublisher),
        )
    }

    #[tokio::test]
    async fn hint_for_unknown_provider_is_permanent() {
        let orchestrator = orchestrator(vec![Arc::new(
            InMemoryProvider::new("directory").primary().with_group("eng", "Engineering"),
        )]);
        let err = orchestrator
            .resolve_providers("eng", Some("nowhere"))
            .await
            .unwrap_err();
        assert_eq!(err.status, OperationStatus::PermanentError);
        assert_eq!(err.error_code.as_deref(), Some(error_codes::PROVIDER_NOT_REGISTERED));
    }

    #[tokio::test]
    async fn two_flagged_primaries_are_ambiguous() {
        let orchestrator = orchestrator(vec![
            Arc::new(InMemoryProvider::new("a").primary().with_group("eng", "Engineering")),
            Arc::new(InMemoryProvider::new("b").primary().with_group("eng", "Engineering")),
        ]);
        let err = orchestrator.resolve_providers("eng", None).await.unwrap_err();
        assert_eq!(err.error_code.as_deref(), Some(error_codes::AMBIGUOUS_PRIMARY));
    }

    #[tokio::test]
    async fn single_defining_provider_acts_as_primary() {
        let orchestrator = orchestrator(vec![
            Arc::new(InMemoryProvider::new("directory").with_group("eng", "Engineering")),
            Arc::new(InMemoryProvider::new("cloud").with_group("ops", "Operations")),
        ]);
        let resolution = orchestrator.resolve_providers("eng", None).await.unwrap();
        assert_eq!(resolution.primary.name(), "directory");
        assert!(resolution.secondaries.is_empty());
    }

    #[tokio::test]
    async fn unflagged_group_on_several_providers_has_no_primary() {
        let orchestrator = orchestrator(vec![
            Arc::new(InMemoryProvider::new("a").with_group("eng", "Engineering")),
            Arc::new(InMemoryProvider::new("b").with_group("eng", "Engineering")),
        ]);
        let err = orchestrator.resolve_providers("eng", None).await.unwrap_err();
        assert_eq!(err.error_code.as_deref(), Some(error_codes::NO_PRIMARY_PROVIDER));
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let orchestrator = orchestrator(vec![Arc::new(
            InMemoryProvider::new("directory").primary().with_group("eng", "Engineering"),
        )]);
        let response = orchestrator
            .add_member(MembershipRequest::new("finance", "ada@example.com"))
            .await;
        assert!(!response.success);
        assert_eq!(response.primary.status, OperationStatus::NotFound);
        assert!(response.primary_provider.is_none());
    }

    #[tokio::test]
    async fn refused_listing_names_the_skipped_provider() {
        let cloud = Arc::new(InMemoryProvider::new("cloud").with_group("eng", "Engineering"));
        cloud.fail_reads_with(OperationResult::permanent("token revoked"));
        let orchestrator = orchestrator(vec![
            Arc::new(InMemoryProvider::new("directory").primary().with_group("eng", "Engineering")),
            cloud.clone(),
        ]);

        let resolution = orchestrator.resolve_providers("eng", None).await.unwrap();
        assert_eq!(resolution.skipped, vec!["cloud".to_string()]);
        assert!(resolution.secondaries.is_empty());

        let response = orchestrator
            .add_member(MembershipRequest::new("eng", "ada@example.com"))
            .await;
        assert!(response.success);
        assert_eq!(response.skipped_providers, vec!["cloud".to_string()]);
        assert!(response.propagation.is_empty());
        assert_eq!(cloud.write_calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_listing_keeps_provider_as_secondary() {
        let cloud = Arc::new(InMemoryProvider::new("cloud").with_group("eng", "Engineering"));
        cloud.fail_reads_with(
            OperationResult::transient("listing stopped early")
                .with_error_code(error_codes::INCOMPLETE_LISTING),
        );
        let orchestrator = orchestrator(vec![
            Arc::new(InMemoryProvider::new("directory").primary().with_group("eng", "Engineering")),
            cloud.clone(),
        ]);

        let response = orchestrator
            .add_member(MembershipRequest::new("eng", "ada@example.com"))
            .await;
        assert!(response.is_fully_consistent());
        assert!(response.skipped_providers.is_empty());
        assert!(response.propagation["cloud"].is_success());
        assert_eq!(cloud.members_of("eng"), vec!["ada@example.com".to_string()]);
    }

    #[tokio::test]
    async fn correlation_id_is_kept_when_supplied() {
        let orchestrator = orchestrator(vec![Arc::new(
            InMemoryProvider::new("directory").primary().with_group("eng", "Engineering"),
        )]);
        let response = orchestrator
            .add_member(
                MembershipRequest::new("eng", "ada@example.com").with_correlation_id("req-42"),
            )
            .await;
        assert!(response.is_fully_consistent());
        assert_eq!(response.correlation_id, "req-42");
    }
}
