use membership_service::config::MembershipConfig;
use membership_service::services::init_metrics;
use membership_service::startup::Application;
use service_core::config::Config as CoreConfig;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Tracing first so configuration errors are logged.
    let common = CoreConfig::load().unwrap_or_default();
    init_tracing("membership-service", &common.log_level, &common.otlp_endpoint);

    init_metrics();

    let config = MembershipConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;
    tracing::info!("Membership service listening on port {}", application.port());

    application.run_until_stopped().await
}
