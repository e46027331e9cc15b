use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use leafscope::{server, Args, Gateway, GatewayConfig, ReadinessState};
use log::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leafscope::init_logger();
    let args = Args::parse();

    info!("=== Starting Leaf Disease Detection Gateway ===");

    let config = GatewayConfig::from(&args);
    let gateway = Gateway::new(config).context("Invalid configuration")?;

    if let Some(image) = &args.image {
        let start = Instant::now();
        info!("One-shot classification of {:?}", image);

        let state = gateway.load().await;
        if let ReadinessState::Failed(reason) = &state {
            error!("Model could not be loaded: {}", reason);
            anyhow::bail!("Model load failed: {}", reason);
        }

        let result = gateway
            .predict_path(image, None)
            .with_context(|| format!("Failed to classify {:?}", image))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        info!("=== Done (took {:.2?}) ===", start.elapsed());
        return Ok(());
    }

    if gateway.config().eager_load {
        info!("Loading model in the background...");
        gateway.trigger_load();
    } else {
        info!("Lazy loading enabled; model loads on first request");
    }

    server::serve(gateway).await
}
