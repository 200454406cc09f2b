use canvas_sync::config::RelayConfig;
use canvas_sync::{db, relay};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = RelayConfig::from_env();

    let pool = match &config.database_url {
        Some(url) => Some(db::init_pool(url).await?),
        None => {
            tracing::info!("DATABASE_URL not set; running without persistence");
            None
        }
    };

    let app = relay::router(relay::RelayState::from_config(&config, pool));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    tracing::info!(port = config.port, "canvas relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
