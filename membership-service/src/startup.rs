//! Application startup and lifecycle management.
//!
//! Builds the provider registry, retry store, propagation pool, orchestrator
//! and reconciliation worker from configuration, and serves the health and
//! metrics endpoints. Shutdown stops the worker first, then drains the pool.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::{MembershipConfig, ProviderConfig, ProviderKind, RetryBackend};
use crate::services::{
    get_metrics, EventPublisher, GroupProvider, InMemoryProvider, InMemoryRetryStore,
    MembershipOrchestrator, MongoRetryStore, ProviderRegistry, ProviderRegistryBuilder,
    RetryStore, ScimProvider, TracingEventPublisher,
};
use crate::workers::{PropagationPool, ReconciliationWorker};

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    store: Arc<dyn RetryStore>,
    registry: Arc<ProviderRegistry>,
    pool: PropagationPool,
}

/// Liveness plus a summary of breaker states and queue depth.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let providers: Vec<_> = state
        .registry
        .breaker_snapshots()
        .into_iter()
        .map(|(name, snapshot)| {
            json!({
                "name": name,
                "circuit": snapshot.state,
                "failure_count": snapshot.failure_count,
            })
        })
        .collect();

    let store_health = state.store.health_check().await;
    let stats = state.store.get_stats().await;

    match (store_health, stats) {
        (Ok(()), Ok(stats)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "membership-service",
                "version": env!("CARGO_PKG_VERSION"),
                "retry_backend": state.store.backend_name(),
                "retry_queue": stats,
                "propagation_in_flight": state.pool.in_flight(),
                "providers": providers,
            })),
        ),
        (Err(e), _) | (_, Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": "membership-service",
                "retry_backend": state.store.backend_name(),
                "error": e.to_string(),
                "providers": providers,
            })),
        ),
    }
}

/// Ready once the retry store answers and at least one provider is registered.
async fn readiness_check(State(state): State<HealthState>) -> Result<StatusCode, AppError> {
    if state.registry.is_empty() || state.pool.is_shut_down() {
        return Err(AppError::ServiceUnavailable);
    }
    state.store.health_check().await.map_err(|e| {
        tracing::warn!(error = %e, "Retry store not ready");
        AppError::ServiceUnavailable
    })?;
    Ok(StatusCode::OK)
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Turn one provider entry into a backend adapter.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn GroupProvider>, AppError> {
    let capabilities = config.effective_capabilities();
    match config.kind {
        ProviderKind::Memory => {
            let mut provider =
                InMemoryProvider::new(config.name.clone()).with_capabilities(capabilities);
            for group in &config.groups {
                let name = group.name.clone().unwrap_or_else(|| group.id.clone());
                provider = provider.with_group(&group.id, &name);
                for member in &group.members {
                    provider = provider.with_member(&group.id, member);
                }
            }
            tracing::info!(
                provider = %config.name,
                groups = config.groups.len(),
                "In-memory provider initialized"
            );
            Ok(Arc::new(provider))
        }
        ProviderKind::Scim => {
            let (Some(base_url), Some(token)) = (&config.base_url, &config.token) else {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "provider {}: scim providers need base_url and token",
                    config.name
                )));
            };
            if token.expose_secret().trim().is_empty() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "provider {}: token is empty",
                    config.name
                )));
            }
            let provider = ScimProvider::new(
                config.name.clone(),
                base_url.clone(),
                token.clone(),
                capabilities,
                config.timeout(),
            )?;
            tracing::info!(
                provider = %config.name,
                base_url = %base_url,
                "SCIM provider initialized"
            );
            Ok(Arc::new(provider))
        }
    }
}

/// Register every configured provider, each behind its own breaker and timeout.
pub fn build_registry(config: &MembershipConfig) -> Result<ProviderRegistry, AppError> {
    let mut builder =
        ProviderRegistryBuilder::new(config.circuit_breaker.clone(), Duration::from_secs(30));
    for provider_config in &config.providers {
        let provider = build_provider(provider_config)?;
        let breaker = provider_config
            .circuit_breaker
            .clone()
            .unwrap_or_else(|| config.circuit_breaker.clone());
        builder = builder
            .register_with(provider, breaker, provider_config.timeout())
            .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?;
    }

    let registry = builder.build();
    if registry.is_empty() {
        tracing::warn!("No providers configured, every membership write will be rejected");
    }
    Ok(registry)
}

pub async fn build_retry_store(
    config: &MembershipConfig,
) -> Result<Arc<dyn RetryStore>, AppError> {
    let policy = config.retry.policy.clone();
    match config.retry.backend {
        RetryBackend::Memory => {
            tracing::info!("Using in-memory retry store, pending retries do not survive restarts");
            Ok(Arc::new(InMemoryRetryStore::new(policy)))
        }
        RetryBackend::Durable => {
            let mongo = config.mongodb.as_ref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "mongodb settings are required when retry.backend = durable"
                ))
            })?;
            let store =
                MongoRetryStore::connect(&mongo.uri, &mongo.database, &mongo.collection, policy)
                    .await?;
            store.initialize_indexes().await.map_err(|e| {
                tracing::error!("Failed to initialize retry store indexes: {}", e);
                e
            })?;
            Ok(Arc::new(store))
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    config: MembershipConfig,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn RetryStore>,
    pool: PropagationPool,
    orchestrator: Arc<MembershipOrchestrator>,
    worker: Arc<ReconciliationWorker>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MembershipConfig) -> Result<Self, AppError> {
        let registry = Arc::new(build_registry(&config)?);
        let store = build_retry_store(&config).await?;
        let pool = PropagationPool::new(config.propagation.max_concurrency);
        let events: Arc<dyn EventPublisher> = Arc::new(TracingEventPublisher);

        let orchestrator = Arc::new(MembershipOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            pool.clone(),
            events,
        ));
        let worker = Arc::new(ReconciliationWorker::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.reconciliation.clone(),
        ));

        // Port 0 binds a random port, used by tests.
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            providers = ?registry.names(),
            retry_backend = store.backend_name(),
            worker_id = %config.reconciliation.worker_id,
            "Membership service built"
        );

        Ok(Self {
            port,
            listener,
            config,
            registry,
            store,
            pool,
            orchestrator,
            worker,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn orchestrator(&self) -> Arc<MembershipOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn store(&self) -> Arc<dyn RetryStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<ProviderRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn worker(&self) -> Arc<ReconciliationWorker> {
        Arc::clone(&self.worker)
    }

    pub fn pool(&self) -> PropagationPool {
        self.pool.clone()
    }

    fn router(&self) -> Router {
        let health_state = HealthState {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            pool: self.pool.clone(),
        };
        Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_endpoint))
            .with_state(health_state)
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves, then stop the worker and drain the pool.
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let worker_token = CancellationToken::new();
        let worker_handle = Arc::clone(&self.worker).spawn(worker_token.clone());

        let served = axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await;
        if let Err(e) = &served {
            tracing::error!("HTTP server error: {}", e);
        }

        worker_token.cancel();
        if let Err(e) = worker_handle.await {
            tracing::error!("Reconciliation worker ended abnormally: {}", e);
        }

        let grace = Duration::from_secs(self.config.propagation.shutdown_grace_seconds);
        if !self.pool.shutdown(grace).await {
            tracing::warn!("Shutdown finished with propagation still in flight");
        }

        tracing::info!("Membership service stopped");
        served
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
