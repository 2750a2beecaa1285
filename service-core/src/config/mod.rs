use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Settings shared by every service binary.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://tempo:4317".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
            otlp_endpoint: default_otlp_endpoint(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        load_layered("configuration", "APP")
    }
}

/// Loads a settings struct from an optional config file overlaid with
/// `<PREFIX>__SECTION__KEY` environment variables.
///
/// Defaults are expected to come from `#[serde(default)]` on `T`.
pub fn load_layered<T: DeserializeOwned>(file_name: &str, env_prefix: &str) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name(file_name).required(false))
        .add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}
