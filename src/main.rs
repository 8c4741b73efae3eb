use anyhow::Result;
use tracing::info;

use morning_brief::config::Config;
use morning_brief::pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("morning_brief=info")),
        )
        .init();

    if config.api_key.is_empty() {
        info!("OPENAI_API_KEY not set — running with deterministic fallbacks only");
    }

    let pipeline = Pipeline::new(config)?;
    let output = pipeline.run().await?;

    info!(
        "Run complete: {} sectors, {} themes, {} alerts",
        output.brief.news_by_sector.len(),
        output.brief.emerging_themes.len(),
        output.brief.watchlist_alerts.len(),
    );
    Ok(())
}
