use secrecy::Secret;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

use crate::services::circuit_breaker::CircuitBreakerConfig;
use crate::services::providers::ProviderCapabilities;
use crate::services::retry_store::RetryPolicy;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MembershipConfig {
    /// Port, log level and OTLP endpoint, read from the shared `APP__` settings.
    #[serde(skip, default)]
    pub common: core_config::Config,
    #[serde(default)]
    #[validate(nested)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub mongodb: Option<MongoConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub interval_seconds: u64,
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: usize,
    #[validate(range(min = 1))]
    pub claim_lease_seconds: u64,
    #[validate(length(min = 1))]
    pub worker_id: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            batch_size: 10,
            claim_lease_seconds: 300,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackend {
    #[default]
    Memory,
    Durable,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    pub backend: RetryBackend,
    #[serde(flatten)]
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_database() -> String {
    "membership_db".to_string()
}

fn default_collection() -> String {
    "retry_records".to_string()
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct PropagationConfig {
    #[validate(range(min = 1, max = 1024))]
    pub max_concurrency: usize,
    /// How long shutdown waits for in-flight propagation before giving up.
    pub shutdown_grace_seconds: u64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            shutdown_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Scim,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<Secret<String>>,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
    /// Overrides the top-level breaker settings for this provider only.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Groups a `memory` provider starts with.
    #[serde(default)]
    pub groups: Vec<SeedGroup>,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Capability flags with the top-level `is_primary` folded in.
    pub fn effective_capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            is_primary: self.is_primary || self.capabilities.is_primary,
            ..self.capabilities
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedGroup {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
}

impl MembershipConfig {
    pub fn load() -> Result<Self, AppError> {
        let mut config: MembershipConfig = core_config::load_layered("membership", "MEMBERSHIP")?;
        config.common = core_config::Config::load()?;
        config.check()?;
        Ok(config)
    }

    /// Field ranges plus the cross-field rules serde cannot express.
    pub fn check(&self) -> Result<(), AppError> {
        self.validate()?;

        let policy = &self.retry.policy;
        if policy.max_attempts == 0 {
            return Err(config_error("retry.max_attempts must be at least 1"));
        }
        if policy.base_delay_seconds > policy.max_delay_seconds {
            return Err(config_error(
                "retry.base_delay_seconds must not exceed retry.max_delay_seconds",
            ));
        }
        if self.retry.backend == RetryBackend::Durable && self.mongodb.is_none() {
            return Err(config_error(
                "mongodb settings are required when retry.backend = durable",
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(config_error(&format!(
                    "provider {} is configured more than once",
                    provider.name
                )));
            }
            if provider.timeout_seconds == 0 {
                return Err(config_error(&format!(
                    "provider {}: timeout_seconds must be at least 1",
                    provider.name
                )));
            }
            if provider.kind == ProviderKind::Scim
                && (provider.base_url.is_none() || provider.token.is_none())
            {
                return Err(config_error(&format!(
                    "provider {}: scim providers need base_url and token",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}

fn config_error(message: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: serde_json::Value) -> MembershipConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse(serde_json::json!({}));
        assert!(config.reconciliation.enabled);
        assert_eq!(config.reconciliation.batch_size, 10);
        assert_eq!(config.reconciliation.claim_lease_seconds, 300);
        assert!(config.reconciliation.worker_id.starts_with("worker-"));
        assert_eq!(config.retry.backend, RetryBackend::Memory);
        assert_eq!(config.retry.policy, RetryPolicy::default());
        assert_eq!(config.propagation.max_concurrency, 16);
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
        assert!(config.check().is_ok());
    }

    #[test]
    fn durable_backend_requires_mongodb() {
        let config = parse(serde_json::json!({ "retry": { "backend": "durable" } }));
        assert!(matches!(config.check(), Err(AppError::ConfigError(_))));

        let config = parse(serde_json::json!({
            "retry": { "backend": "durable", "max_attempts": 3 },
            "mongodb": { "uri": "mongodb://localhost:27017" }
        }));
        assert!(config.check().is_ok());
        assert_eq!(config.retry.policy.max_attempts, 3);
        assert_eq!(config.mongodb.unwrap().collection, "retry_records");
    }

    #[test]
    fn provider_settings_parse() {
        let config = parse(serde_json::json!({
            "providers": [
                { "name": "directory", "kind": "memory", "is_primary": true,
                  "groups": [{ "id": "eng", "members": ["ada@example.com"] }] },
                { "name": "cloud", "kind": "scim", "base_url": "https://scim.example.com",
                  "token": "s3cret", "timeout_seconds": 5,
                  "circuit_breaker": { "failure_threshold": 2 } }
            ]
        }));
        assert!(config.check().is_ok());

        let directory = &config.providers[0];
        assert!(directory.effective_capabilities().is_primary);
        assert_eq!(directory.groups[0].members, vec!["ada@example.com"]);

        let cloud = &config.providers[1];
        assert_eq!(cloud.timeout(), Duration::from_secs(5));
        let breaker = cloud.circuit_breaker.clone().unwrap();
        assert_eq!(breaker.failure_threshold, 2);
        assert_eq!(breaker.recovery_timeout_seconds, 60);
    }

    #[test]
    fn scim_provider_without_credentials_is_rejected() {
        let config = parse(serde_json::json!({
            "providers": [{ "name": "cloud", "kind": "scim" }]
        }));
        assert!(config.check().is_err());
    }

    #[test]
    fn duplicate_provider_names_are_rejected() {
        let config = parse(serde_json::json!({
            "providers": [
                { "name": "cloud", "kind": "memory" },
                { "name": "cloud", "kind": "memory" }
            ]
        }));
        assert!(config.check().is_err());
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = parse(serde_json::json!({
            "retry": { "base_delay_seconds": 600, "max_delay_seconds": 60 }
        }));
        assert!(config.check().is_err());
    }
}
