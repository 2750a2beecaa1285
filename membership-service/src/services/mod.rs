pub mod circuit_breaker;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod providers;
pub mod retry_store;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use events::{BroadcastEventPublisher, EventPublisher, TracingEventPublisher};
pub use metrics::{get_metrics, init_metrics};
pub use orchestrator::{
    MembershipOrchestrator, MembershipRequest, MembershipResponse, ProviderResolution,
};
pub use providers::{
    GroupProvider, GuardedProvider, InMemoryProvider, ProviderCapabilities, ProviderRegistry,
    ProviderRegistryBuilder, RegistryError, RoleReporter, ScimProvider,
};
pub use retry_store::{InMemoryRetryStore, MongoRetryStore, RetryPolicy, RetryStore};
