mod common;

use common::{Harness, GROUP, MEMBER};
use membership_service::models::{MembershipAction, OperationResult, RetryPayload, RetryRecord};
use membership_service::services::{MembershipRequest, RetryPolicy, RetryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn queue_failed_cloud_write(h: &Harness) -> String {
    let response = h
        .orchestrator
        .add_member(MembershipRequest::new(GROUP, MEMBER))
        .await;
    assert!(response.success);
    assert_eq!(response.retry_record_ids.len(), 1);
    response.retry_record_ids[0].clone()
}

#[tokio::test]
async fn successful_replay_deletes_the_record() {
    let h = Harness::new();
    h.cloud
        .fail_next_writes(OperationResult::transient("throttled"), 1);
    let id = queue_failed_cloud_write(&h).await;
    assert!(!h.cloud.members_of(GROUP).contains(&MEMBER.to_string()));

    let report = h.worker("worker-a").run_cycle().await.unwrap();

    assert_eq!(report.fetched, 1);
    assert_eq!(report.succeeded, 1);
    assert!(h.store.get(&id).await.unwrap().is_none());
    assert!(h.store.fetch_due(10).await.unwrap().is_empty());
    assert!(h.cloud.members_of(GROUP).contains(&MEMBER.to_string()));
}

#[tokio::test]
async fn failing_replay_backs_off_then_dead_letters() {
    let h = Harness::with_policy(RetryPolicy {
        max_attempts: 2,
        ..Default::default()
    });
    h.cloud
        .fail_writes_with(OperationResult::transient("backend down"));
    let id = queue_failed_cloud_write(&h).await;
    let worker = h.worker("worker-a");

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.retried, 1);
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 1);
    assert!(record.next_retry_at > record.updated_at);
    assert!(record.claimed_by.is_none());

    // Still backing off.
    assert_eq!(worker.run_cycle().await.unwrap().fetched, 0);

    h.expire_backoff().await;
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    let record = h.store.get(&id).await.unwrap().unwrap();
    assert!(record.is_dead_letter());
    assert_eq!(record.attempts, 2);
    assert!(h.store.fetch_due(10).await.unwrap().is_empty());
    assert_eq!(h.store.list_dead_letters(10).await.unwrap().len(), 1);

    let stats = h.store.get_stats().await.unwrap();
    assert_eq!(stats.dead_letter, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn permanent_replay_failure_moves_toward_dead_letter() {
    let h = Harness::new();
    h.cloud
        .fail_writes_with(OperationResult::permanent("account disabled"));
    let id = queue_failed_cloud_write(&h).await;

    let report = h.worker("worker-a").run_cycle().await.unwrap();

    assert_eq!(report.retried, 1);
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 1);
    assert!(record
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("PERMANENT_ERROR"));
}

#[tokio::test]
async fn removal_replay_of_absent_member_completes() {
    let h = Harness::new();
    let id = h
        .store
        .enqueue(RetryRecord::new(RetryPayload {
            group_id: GROUP.to_string(),
            provider: "chat".to_string(),
            action: MembershipAction::RemoveMember,
            member_email: MEMBER.to_string(),
            correlation_id: "corr-remove".to_string(),
        }))
        .await
        .unwrap();

    let report = h.worker("worker-a").run_cycle().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert!(h.store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn batch_size_limits_one_cycle() {
    let h = Harness::new();
    for i in 0..15 {
        h.store
            .enqueue(RetryRecord::new(RetryPayload {
                group_id: GROUP.to_string(),
                provider: "cloud".to_string(),
                action: MembershipAction::AddMember,
                member_email: format!("user{}@example.com", i),
                correlation_id: format!("corr-{}", i),
            }))
            .await
            .unwrap();
    }

    let worker = h.worker("worker-a");
    assert_eq!(worker.run_cycle().await.unwrap().succeeded, 10);
    assert_eq!(worker.run_cycle().await.unwrap().succeeded, 5);
    assert_eq!(h.store.get_stats().await.unwrap().total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_replay_each_record_once() {
    let h = Harness::new();
    for i in 0..8 {
        h.store
            .enqueue(RetryRecord::new(RetryPayload {
                group_id: GROUP.to_string(),
                provider: "chat".to_string(),
                action: MembershipAction::AddMember,
                member_email: format!("user{}@example.com", i),
                correlation_id: format!("corr-{}", i),
            }))
            .await
            .unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|i| Arc::new(h.worker(&format!("worker-{}", i))))
        .collect();
    let handles: Vec<_> = workers
        .iter()
        .cloned()
        .map(|w| tokio::spawn(async move { w.run_cycle().await.unwrap() }))
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        succeeded += handle.await.unwrap().succeeded;
    }

    assert_eq!(succeeded, 8);
    assert_eq!(h.chat.write_calls(), 8);
    assert_eq!(h.store.get_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn spawned_worker_drains_until_cancelled() {
    let h = Harness::new();
    h.cloud
        .fail_next_writes(OperationResult::transient("throttled"), 1);
    queue_failed_cloud_write(&h).await;

    let token = CancellationToken::new();
    let handle = Arc::new(h.worker("worker-a")).spawn(token.clone());

    for _ in 0..100 {
        if h.store.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.store.is_empty());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stops after cancellation")
        .unwrap();
}
