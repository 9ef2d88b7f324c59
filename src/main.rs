mod api;
mod app_state;
mod config;
mod cors;
mod engine;
mod error;
mod reply;
mod types;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use app_state::ModelService;
use config::AppConfig;

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!("Starting LLM service...");
    tracing::info!("Model to load: {}", config.model_name);
    tracing::info!("Model will be cached in: {}", config.model_path);

    let port = config.port;
    let service = ModelService::new(config);
    tracing::info!("Device: {}", service.device());

    // Load before serving; a failed load still lets the server start.
    let loader = Arc::clone(&service);
    let loaded = tokio::task::spawn_blocking(move || loader.load()).await?;
    if loaded {
        tracing::info!("Model loaded successfully!");
    } else {
        tracing::error!("Failed to load model. Service will still start but chat endpoints will fail.");
    }

    tracing::info!("Starting server on port {port}");
    let _ = api::build_rocket(service, port).launch().await?;
    Ok(())
}
