use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use hf_hub::api::tokio::Api;
use kiln_core::{load_pipeline, DeviceMap, TextToImage};
use tokio::{net::TcpListener, sync::Mutex};
use tracing_subscriber::EnvFilter;

mod bucket;
mod handler;
mod output;

use handler::Job;
use output::OutputConfig;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln image generation worker")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model to serve
    #[arg(long, default_value = "stabilityai/stable-diffusion-3-medium")]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Root for job-scoped scratch directories (defaults to the OS temp dir)
    #[arg(long)]
    output_root: Option<PathBuf>,
}

// Application state containing the resident pipeline and output settings.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Mutex<Box<dyn TextToImage>>>,
    output: Arc<OutputConfig>,
}

async fn run_job_handler(
    State(state): State<AppState>,
    Json(job): Json<Job>,
) -> impl IntoResponse {
    let mut pipeline = state.pipeline.lock().await;
    match handler::handle_job(pipeline.as_mut(), &job, &state.output).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            tracing::error!(job_id = %job.id, error = ?e, "job failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e:?}")).into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    // The listener only binds once the pipeline is resident.
    "ok"
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // --- Load the pipeline once, before accepting any job ---
    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let model_name = args.model.clone();
    let pipeline = tokio::spawn(async move {
        let api = Api::new().context("failed to create hf hub API")?;
        load_pipeline(&model_name, api, device_map).await
    })
    .await
    .context("pipeline load task panicked")??;
    tracing::info!(model = %args.model, "pipeline resident");

    let output_root = args.output_root.unwrap_or_else(std::env::temp_dir);
    let output = OutputConfig::from_env(output_root)?;
    match &output.bucket {
        Some(_) => tracing::info!("bucket endpoint configured, images will be uploaded"),
        None => tracing::info!("no bucket endpoint, images will be returned as data URIs"),
    }

    let state = AppState {
        pipeline: Arc::new(Mutex::new(pipeline)),
        output: Arc::new(output),
    };

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/run", post(run_job_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %listener.local_addr()?, "started worker");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
