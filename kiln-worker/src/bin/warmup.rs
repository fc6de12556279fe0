use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::Api;
use kiln_core::{warmup, RetryPolicy, Sd3Variant};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Pre-fetches model weights into the local cache")]
struct Args {
    /// Model to warm up
    #[arg(long, default_value = "stabilityai/stable-diffusion-3-medium")]
    model: String,

    /// Fetch attempts per artifact
    #[arg(long, default_value_t = 3)]
    attempts: usize,

    /// Delay between attempts, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let variant = Sd3Variant::from_name(&args.model)
        .with_context(|| format!("unsupported model: {}", args.model))?;
    let api = Api::new().context("failed to create hf hub API")?;
    let policy = RetryPolicy::new(args.attempts, Duration::from_millis(args.delay_ms));

    warmup::prefetch(variant, &api, &policy).await?;
    tracing::info!(model = %args.model, "cache warm");

    Ok(())
}
