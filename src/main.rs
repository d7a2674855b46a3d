use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use medical_chatbot::chat::ChatService;
use medical_chatbot::db::Database;
use medical_chatbot::ingest::Ingestor;
use medical_chatbot::providers::Providers;
use medical_chatbot::server::AppState;
use medical_chatbot::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let db = Database::new(&config).await?;
    let providers = Providers::from_config(&config)?;

    let generation_limit = Arc::new(Semaphore::new(
        config.models.max_concurrent_generations.max(1),
    ));

    let chat = ChatService::new(&config, db.clone(), providers.clone(), generation_limit);
    let ingestor = Ingestor::new(&config, db.clone(), providers);

    run_server(config, AppState::new(db, chat, ingestor)).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
