use anyhow::Result;
use tejas::Tejas;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tejas=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app = Tejas::new().map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))?;

    tracing::info!(port = app.config().port, "starting tejas");

    app.takeoff()
        .await
        .map_err(|e| anyhow::anyhow!("server error: {}", e))?;

    Ok(())
}
