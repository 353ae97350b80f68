use personal_finance_orchestrator::{api::start_server, config::AssistantConfig, services::Services};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AssistantConfig::from_env();

    info!("Personal Finance Orchestrator - API Server");
    info!(
        port = config.port,
        model = %config.gemini_model,
        audit_sample_rate = config.graph.audit_sample_rate,
        "Configuration loaded"
    );

    let services = Arc::new(Services::from_config(&config)?);

    info!("Services initialized, starting API server");

    start_server(services, config.port).await?;

    Ok(())
}
