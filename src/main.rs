use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use mathmate::chat::ChatService;
use mathmate::db::Database;
use mathmate::openai::OpenAiClient;
use mathmate::tutor::{InMemorySessionStore, Rewriter};
use mathmate::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;

    let db = Database::new(&config).await?;
    let gateway = OpenAiClient::new(config.models.clone());

    let store = InMemorySessionStore::with_capacity(config.limits.memory_capacity);
    let rewriter = Rewriter::new(Arc::new(store));

    let generation_limit = Arc::new(Semaphore::new(config.limits.generation_concurrency));

    tracing::info!(
        model = %config.models.model,
        structured_judgment = config.models.structured_judgment,
        "starting mathmate"
    );

    let chat = ChatService::new(config.clone(), db, gateway, rewriter, generation_limit);

    run_server(config, chat).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
