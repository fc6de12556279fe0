pub mod device_map;
pub mod loader;
mod loader_factory;
pub mod retry;
pub mod schema;
mod util;
pub mod warmup;

mod sd3;

pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use retry::RetryPolicy;
pub use sd3::{Artifact, Sd3Loader, Sd3Pipeline, Sd3Variant};
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

/// Fully validated generation parameters, as handed to the pipeline.
///
/// Built from a raw job input via [`schema::validate`] plus seed resolution;
/// every field is concrete by the time a pipeline sees it.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    /// Fraction of the sigma schedule to run; 1.0 denoises fully.
    pub noise_frac: f64,
    pub num_images: usize,
    pub seed: u64,
}

pub trait TextToImage: Send {
    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<Vec<DynamicImage>>;
}
