use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{GroupProvider, GuardedProvider};
use crate::services::circuit_breaker::{CircuitBreakerConfig, CircuitSnapshot};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Provider name must not be empty")]
    EmptyName,

    #[error("Provider already registered: {0}")]
    Duplicate(String),
}

/// Collects providers during startup. Consumed by [`build`](Self::build).
pub struct ProviderRegistryBuilder {
    providers: Vec<Arc<GuardedProvider>>,
    default_breaker: CircuitBreakerConfig,
    default_timeout: Duration,
}

impl Default for ProviderRegistryBuilder {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), Duration::from_secs(30))
    }
}

impl ProviderRegistryBuilder {
    pub fn new(default_breaker: CircuitBreakerConfig, default_timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            default_breaker,
            default_timeout,
        }
    }

    pub fn register(self, provider: Arc<dyn GroupProvider>) -> Result<Self, RegistryError> {
        let breaker = self.default_breaker.clone();
        let timeout = self.default_timeout;
        self.register_with(provider, breaker, timeout)
    }

    pub fn register_with(
        mut self,
        provider: Arc<dyn GroupProvider>,
        breaker: CircuitBreakerConfig,
        call_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let name = provider.name().to_string();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.providers.iter().any(|p| p.name() == name) {
            return Err(RegistryError::Duplicate(name));
        }

        tracing::info!(
            provider = %name,
            is_primary = provider.capabilities().is_primary,
            failure_threshold = breaker.failure_threshold,
            "Registered provider"
        );
        self.providers
            .push(Arc::new(GuardedProvider::new(provider, breaker, call_timeout)));
        Ok(self)
    }

    pub fn build(self) -> ProviderRegistry {
        let by_name = self
            .providers
            .iter()
            .enumerate()
            .map(|(idx, p)| (p.name().to_string(), idx))
            .collect();
        ProviderRegistry {
            providers: self.providers,
            by_name,
        }
    }
}

/// Read-only set of guarded providers, in registration order.
#[derive(Debug)]
pub struct ProviderRegistry {
    providers: Vec<Arc<GuardedProvider>>,
    by_name: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<GuardedProvider>> {
        self.by_name
            .get(name)
            .map(|&idx| Arc::clone(&self.providers[idx]))
    }

    pub fn providers(&self) -> &[Arc<GuardedProvider>] {
        &self.providers
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn breaker_snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        self.providers
            .iter()
            .map(|p| (p.name().to_string(), p.breaker().snapshot()))
            .collect()
    }
}
