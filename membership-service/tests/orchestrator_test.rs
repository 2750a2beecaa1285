mod common;

use common::{Harness, GROUP, MEMBER};
use membership_service::models::{
    error_codes, MembershipAction, MembershipEventType, OperationResult, OperationStatus,
};
use membership_service::services::{MembershipRequest, RetryStore};
use std::time::Duration;

#[tokio::test]
async fn successful_write_reaches_every_provider() {
    let h = Harness::new();

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, MEMBER).with_justification("on-call rotation"))
        .await;

    assert!(response.success);
    assert!(!response.partial_failures);
    assert!(response.is_fully_consistent());
    assert_eq!(response.primary_provider.as_deref(), Some("directory"));
    assert_eq!(response.primary.status, OperationStatus::Success);
    assert_eq!(response.propagation.len(), 2);
    assert!(response.propagation.values().all(|r| r.is_success()));
    assert!(response.retry_record_ids.is_empty());

    for provider in [&h.directory, &h.cloud, &h.chat] {
        assert!(provider.members_of(GROUP).contains(&MEMBER.to_string()));
    }
    assert_eq!(h.store.get_stats().await.unwrap().total, 0);
}

#[tokio::test(start_paused = true)]
async fn secondary_timeout_is_queued_for_reconciliation() {
    let h = Harness::new();
    h.cloud.set_latency(Duration::from_secs(5));

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, MEMBER))
        .await;

    assert!(response.success);
    assert!(response.partial_failures);
    assert_eq!(response.propagation.len(), 2);

    let cloud = &response.propagation["cloud"];
    assert_eq!(cloud.status, OperationStatus::TransientError);
    assert_eq!(cloud.error_code.as_deref(), Some(error_codes::TIMEOUT));
    assert!(response.propagation["chat"].is_success());

    let queued = h.store.snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempts, 0);
    assert_eq!(queued[0].payload.provider, "cloud");
    assert_eq!(queued[0].payload.action, MembershipAction::AddMember);
    assert_eq!(queued[0].payload.correlation_id, response.correlation_id);
    assert_eq!(response.retry_record_ids, vec![queued[0].id.clone()]);
}

#[tokio::test]
async fn removing_an_absent_member_is_terminal() {
    let h = Harness::new();

    let response = h
        .orchestrator
        .remove_member(MembershipRequest::new(GROUP, MEMBER))
        .await;

    assert!(response.success);
    assert_eq!(response.primary.status, OperationStatus::NotFound);
    assert!(!response.partial_failures);
    assert!(response
        .propagation
        .values()
        .all(|r| r.status == OperationStatus::NotFound));
    assert_eq!(h.store.get_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn primary_failure_fails_the_operation_and_queues_nothing() {
    let h = Harness::new();
    h.directory
        .fail_writes_with(OperationResult::transient("directory unavailable"));

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, MEMBER))
        .await;

    assert!(!response.success);
    assert_eq!(response.primary.status, OperationStatus::TransientError);
    assert!(response.propagation.is_empty());
    assert!(response.retry_record_ids.is_empty());
    assert_eq!(h.cloud.write_calls(), 0);
    assert_eq!(h.chat.write_calls(), 0);
    assert_eq!(h.store.get_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn permanent_secondary_failure_is_recorded_and_queued_once() {
    let h = Harness::new();
    h.chat.fail_writes_with(
        OperationResult::permanent("forbidden").with_error_code(error_codes::UNAUTHORIZED),
    );

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, MEMBER))
        .await;

    assert!(response.success);
    assert!(response.partial_failures);
    assert_eq!(
        response.propagation["chat"].status,
        OperationStatus::PermanentError
    );
    assert!(response.propagation["cloud"].is_success());

    let queued = h.store.snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload.provider, "chat");
    assert!(queued[0].last_error.as_deref().unwrap().contains("PERMANENT_ERROR"));
}

#[tokio::test]
async fn panicking_secondary_is_downgraded_and_queued() {
    let h = Harness::new();
    h.chat.panic_on_writes(true);

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, MEMBER))
        .await;

    assert!(response.success);
    let chat = &response.propagation["chat"];
    assert_eq!(chat.status, OperationStatus::TransientError);
    assert_eq!(chat.error_code.as_deref(), Some(error_codes::UNEXPECTED_FAULT));
    assert_eq!(response.retry_record_ids.len(), 1);
}

#[tokio::test]
async fn provider_hint_overrides_the_primary_flag() {
    let h = Harness::new();
    h.directory
        .fail_writes_with(OperationResult::transient("directory unavailable"));

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, MEMBER).with_provider_hint("cloud"))
        .await;

    assert!(response.success);
    assert_eq!(response.primary_provider.as_deref(), Some("cloud"));
    assert_eq!(
        response.propagation["directory"].status,
        OperationStatus::TransientError
    );
    assert_eq!(h.store.snapshot()[0].payload.provider, "directory");
}

#[tokio::test]
async fn hint_for_provider_without_the_group_is_not_found() {
    let h = Harness::new();

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new("marketing", MEMBER).with_provider_hint("directory"))
        .await;

    assert!(!response.success);
    assert_eq!(response.primary.status, OperationStatus::NotFound);
    assert_eq!(
        response.primary.error_code.as_deref(),
        Some(error_codes::GROUP_NOT_FOUND)
    );
}

#[tokio::test]
async fn invalid_requests_never_reach_a_provider() {
    let h = Harness::new();

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, "not-an-email"))
        .await;

    assert!(!response.success);
    assert_eq!(response.primary.status, OperationStatus::PermanentError);
    assert_eq!(
        response.primary.error_code.as_deref(),
        Some(error_codes::VALIDATION_ERROR)
    );
    assert_eq!(h.directory.write_calls() + h.directory.read_calls(), 0);

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new("", MEMBER))
        .await;
    assert_eq!(
        response.primary.error_code.as_deref(),
        Some(error_codes::VALIDATION_ERROR)
    );
}

#[tokio::test]
async fn group_on_a_single_provider_has_no_propagation() {
    let h = Harness::new();

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new("marketing", MEMBER))
        .await;

    assert!(response.success);
    assert_eq!(response.primary_provider.as_deref(), Some("chat"));
    assert!(response.propagation.is_empty());
}

#[tokio::test]
async fn successful_primary_write_publishes_an_event() {
    let h = Harness::new();
    let mut events = h.events.subscribe();

    let response = h
        .orchestrator
        .remove_member(MembershipRequest::new(GROUP, "grace@example.com"))
        .await;
    assert!(response.success);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within timeout")
        .unwrap();
    assert_eq!(event.event_type, MembershipEventType::MemberRemoved);
    assert_eq!(event.provider, "directory");
    assert_eq!(event.correlation_id, response.correlation_id);
}

#[tokio::test]
async fn pending_reconciliation_is_queryable_by_correlation_id() {
    let h = Harness::new();
    h.cloud.fail_writes_with(OperationResult::transient("throttled"));
    h.chat.fail_writes_with(OperationResult::transient("throttled"));

    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, MEMBER).with_correlation_id("change-123"))
        .await;
    assert_eq!(response.retry_record_ids.len(), 2);

    let pending = h
        .orchestrator
        .pending_reconciliation("change-123")
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|r| r.attempts == 0));
    assert!(h
        .orchestrator
        .pending_reconciliation("other")
        .await
        .unwrap()
        .is_empty());
}
