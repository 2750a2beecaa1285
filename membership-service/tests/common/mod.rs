#![allow(dead_code)]

use membership_service::config::{
    MembershipConfig, ProviderConfig, ProviderKind, ReconciliationConfig, SeedGroup,
};
use membership_service::services::{
    BroadcastEventPublisher, CircuitBreakerConfig, InMemoryProvider, InMemoryRetryStore,
    MembershipOrchestrator, ProviderRegistry, ProviderRegistryBuilder, RetryPolicy, RetryStore,
};
use membership_service::startup::Application;
use membership_service::workers::{PropagationPool, ReconciliationWorker};
use service_core::config::Config as CoreConfig;
use std::sync::Arc;
use std::time::Duration;

pub const GROUP: &str = "eng-oncall";
pub const MEMBER: &str = "ada@example.com";

/// Three in-memory backends that all define [`GROUP`]; `directory` is primary.
pub struct Harness {
    pub directory: Arc<InMemoryProvider>,
    pub cloud: Arc<InMemoryProvider>,
    pub chat: Arc<InMemoryProvider>,
    pub registry: Arc<ProviderRegistry>,
    pub store: Arc<InMemoryRetryStore>,
    pub pool: PropagationPool,
    pub events: Arc<BroadcastEventPublisher>,
    pub orchestrator: MembershipOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let directory = Arc::new(
            InMemoryProvider::new("directory")
                .primary()
                .with_group(GROUP, "Engineering on-call")
                .with_member(GROUP, "grace@example.com"),
        );
        let cloud = Arc::new(
            InMemoryProvider::new("cloud")
                .with_group(GROUP, "Engineering on-call")
                .with_member(GROUP, "grace@example.com"),
        );
        let chat = Arc::new(
            InMemoryProvider::new("chat")
                .with_group(GROUP, "Engineering on-call")
                .with_group("marketing", "Marketing"),
        );

        let registry = ProviderRegistryBuilder::new(
            CircuitBreakerConfig::default(),
            Duration::from_millis(200),
        )
        .register(directory.clone())
        .and_then(|b| b.register(cloud.clone()))
        .and_then(|b| b.register(chat.clone()))
        .expect("providers register")
        .build();
        let registry = Arc::new(registry);

        let store = Arc::new(InMemoryRetryStore::new(policy));
        let pool = PropagationPool::new(8);
        let events = Arc::new(BroadcastEventPublisher::new(16));
        let orchestrator = MembershipOrchestrator::new(
            registry.clone(),
            store.clone(),
            pool.clone(),
            events.clone(),
        );

        Self {
            directory,
            cloud,
            chat,
            registry,
            store,
            pool,
            events,
            orchestrator,
        }
    }

    pub fn worker(&self, worker_id: &str) -> ReconciliationWorker {
        ReconciliationWorker::new(
            self.registry.clone(),
            self.store.clone() as Arc<dyn RetryStore>,
            ReconciliationConfig {
                worker_id: worker_id.to_string(),
                ..Default::default()
            },
        )
    }

    /// Make every queued record due now, as if its backoff had elapsed.
    pub async fn expire_backoff(&self) {
        for record in self.store.snapshot() {
            if record.is_dead_letter() {
                continue;
            }
            let mut due = record.clone();
            due.next_retry_at = due.updated_at;
            self.store.mark_success(&record.id).await.unwrap();
            self.store.enqueue(due).await.unwrap();
        }
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub orchestrator: Arc<MembershipOrchestrator>,
    pub store: Arc<dyn RetryStore>,
    pub pool: PropagationPool,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let mut config: MembershipConfig =
            serde_json::from_value(serde_json::json!({})).expect("default config");
        config.common = CoreConfig {
            port: 0,
            ..Default::default()
        };
        config.reconciliation.interval_seconds = 3600;
        config.providers = vec![
            memory_provider("directory", true),
            memory_provider("cloud", false),
        ];

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);
        let orchestrator = app.orchestrator();
        let store = app.store();
        let pool = app.pool();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the HTTP server by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            orchestrator,
            store,
            pool,
        }
    }
}

fn memory_provider(name: &str, is_primary: bool) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        kind: ProviderKind::Memory,
        base_url: None,
        token: None,
        is_primary,
        timeout_seconds: 5,
        capabilities: Default::default(),
        circuit_breaker: None,
        groups: vec![SeedGroup {
            id: GROUP.to_string(),
            name: Some("Engineering on-call".to_string()),
            members: vec![],
        }],
    }
}
