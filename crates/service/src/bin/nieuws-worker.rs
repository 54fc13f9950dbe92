//! Pipeline worker: loads config, wires the components and runs until
//! interrupted. The only place that may terminate the process.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nieuws_core::config::{load_dotenv, Config};
use nieuws_service::Pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let pipeline = Pipeline::build(config)
        .await
        .context("pipeline init failed")?;

    info!("nieuws worker running — ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    pipeline.shutdown().await;
    Ok(())
}
