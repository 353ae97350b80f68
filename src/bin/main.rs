use personal_finance_orchestrator::{config::AssistantConfig, services::Services, AssistantRequest};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let query = args.next().ok_or("usage: assistant \"<question>\" [user_id]")?;
    let user_id: i64 = match args.next() {
        Some(raw) => raw.parse()?,
        None => 1,
    };

    let config = AssistantConfig::from_env();
    let services = Services::from_config(&config)?;

    info!(user_id, "Personal finance assistant starting");

    let response = services
        .assistant
        .handle(AssistantRequest {
            query,
            user_id,
            conversation_id: None,
            metadata: None,
        })
        .await;

    println!("\n=== ASSISTANT ===");
    println!("{}", response.final_output);
    if let Some(rows) = &response.data {
        println!("\nData:");
        println!("{}", serde_json::to_string_pretty(rows)?);
    }
    if let Some(id) = response.conversation_id {
        println!("\nConversation: {}", id);
    }

    Ok(())
}
