//! CLI entry point running one inpainting prediction.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = lamafill::config::CliArgs::parse();
    let (source, request) = cli.into_job();

    match lamafill::run(source, request).await {
        Ok(Some(path)) => tracing::info!(path = %path.display(), "done"),
        Ok(None) => {}
        Err(error) => return Err(Box::<dyn std::error::Error>::from(error)),
    }

    Ok(())
}
