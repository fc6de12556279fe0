use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::mmdit::model::{Config as MMDiTConfig, MMDiT};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

mod sampling;
mod text;
mod vae;

use crate::{select_best_device, tensor_to_image, DeviceMap, GenerationRequest, Loader, TextToImage};
use text::{TextEncoderFiles, TripleClip};

const SD3_MEDIUM_REPO: &str = "stabilityai/stable-diffusion-3-medium";
const SD3_MEDIUM_FILE: &str = "sd3_medium_incl_clips_t5xxlfp16.safetensors";
const SD3_5_LARGE_REPO: &str = "stabilityai/stable-diffusion-3.5-large";
const SD3_5_LARGE_FILE: &str = "sd3.5_large.safetensors";
const SD3_5_LARGE_TURBO_REPO: &str = "stabilityai/stable-diffusion-3.5-large-turbo";
const SD3_5_LARGE_TURBO_FILE: &str = "sd3.5_large_turbo.safetensors";
const SPLIT_CLIP_REPO: &str = "Comfy-Org/stable-diffusion-3.5-fp8";
const SPLIT_CLIP_G_FILE: &str = "text_encoders/clip_g.safetensors";
const SPLIT_CLIP_L_FILE: &str = "text_encoders/clip_l.safetensors";
const SPLIT_T5_FILE: &str = "text_encoders/t5xxl_fp16.safetensors";

const CLIP_L_TOKENIZER: Artifact = Artifact::new("openai/clip-vit-large-patch14", "tokenizer.json");
const CLIP_G_TOKENIZER: Artifact =
    Artifact::new("laion/CLIP-ViT-bigG-14-laion2B-39B-b160k", "tokenizer.json");
const T5_CONFIG: Artifact =
    Artifact::with_revision("google/t5-v1_1-xxl", "refs/pr/2", "config.json");
const T5_TOKENIZER: Artifact = Artifact::new("lmz/mt5-tokenizers", "t5-v1_1-xxl.tokenizer.json");

/// One downloadable model-hub file; the unit both the warm-upper and the
/// loader work in, so pre-warming covers exactly what loading reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Artifact {
    pub repo_id: &'static str,
    pub revision: Option<&'static str>,
    pub filename: &'static str,
}

impl Artifact {
    const fn new(repo_id: &'static str, filename: &'static str) -> Self {
        Self {
            repo_id,
            revision: None,
            filename,
        }
    }

    const fn with_revision(
        repo_id: &'static str,
        revision: &'static str,
        filename: &'static str,
    ) -> Self {
        Self {
            repo_id,
            revision: Some(revision),
            filename,
        }
    }

    pub fn repo(&self) -> hf_hub::Repo {
        match self.revision {
            Some(revision) => hf_hub::Repo::with_revision(
                self.repo_id.to_string(),
                hf_hub::RepoType::Model,
                revision.to_string(),
            ),
            None => hf_hub::Repo::model(self.repo_id.to_string()),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo_id, self.filename)
    }
}

/// Supported SD3 checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sd3Variant {
    #[serde(rename = "3-medium")]
    Medium,
    #[serde(rename = "3.5-large")]
    ThreeFiveLarge,
    #[serde(rename = "3.5-large-turbo")]
    ThreeFiveLargeTurbo,
}

serde_plain::derive_display_from_serialize!(Sd3Variant);
serde_plain::derive_fromstr_from_deserialize!(Sd3Variant);

impl Sd3Variant {
    /// Detect the variant from a model name.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("3.5") || name_upper.contains("3-5") {
            if name_upper.contains("TURBO") {
                Some(Sd3Variant::ThreeFiveLargeTurbo)
            } else {
                Some(Sd3Variant::ThreeFiveLarge)
            }
        } else if name_upper.contains("STABLE-DIFFUSION-3") || name_upper.contains("SD3") {
            Some(Sd3Variant::Medium)
        } else {
            None
        }
    }

    fn weight_artifacts(&self) -> Vec<Artifact> {
        match self {
            Sd3Variant::Medium => vec![Artifact::new(SD3_MEDIUM_REPO, SD3_MEDIUM_FILE)],
            Sd3Variant::ThreeFiveLarge => vec![
                Artifact::new(SD3_5_LARGE_REPO, SD3_5_LARGE_FILE),
                Artifact::new(SPLIT_CLIP_REPO, SPLIT_CLIP_G_FILE),
                Artifact::new(SPLIT_CLIP_REPO, SPLIT_CLIP_L_FILE),
                Artifact::new(SPLIT_CLIP_REPO, SPLIT_T5_FILE),
            ],
            Sd3Variant::ThreeFiveLargeTurbo => vec![
                Artifact::new(SD3_5_LARGE_TURBO_REPO, SD3_5_LARGE_TURBO_FILE),
                Artifact::new(SPLIT_CLIP_REPO, SPLIT_CLIP_G_FILE),
                Artifact::new(SPLIT_CLIP_REPO, SPLIT_CLIP_L_FILE),
                Artifact::new(SPLIT_CLIP_REPO, SPLIT_T5_FILE),
            ],
        }
    }

    /// Everything the loader reads from the local cache.
    pub fn artifacts(&self) -> Vec<Artifact> {
        let mut artifacts = self.weight_artifacts();
        artifacts.extend([CLIP_L_TOKENIZER, CLIP_G_TOKENIZER, T5_CONFIG, T5_TOKENIZER]);
        artifacts
    }

    fn mmdit_config(&self) -> MMDiTConfig {
        match self {
            Sd3Variant::Medium => MMDiTConfig::sd3_medium(),
            Sd3Variant::ThreeFiveLarge | Sd3Variant::ThreeFiveLargeTurbo => {
                MMDiTConfig::sd3_5_large()
            }
        }
    }
}

async fn fetch(api: &Api, artifact: Artifact) -> Result<PathBuf> {
    api.repo(artifact.repo())
        .get(artifact.filename)
        .await
        .with_context(|| format!("failed to fetch {artifact}"))
}

pub struct Sd3Pipeline {
    device: Device,
    text: TripleClip,
    mmdit: MMDiT,
    vae: AutoEncoderKL,
}

impl TextToImage for Sd3Pipeline {
    fn run(&mut self, request: &GenerationRequest) -> Result<Vec<DynamicImage>> {
        self.device.set_seed(request.seed)?;

        let (context, y) = self.text.encode(&request.prompt, &self.device)?;
        let (context_uncond, y_uncond) = self.text.encode(&request.negative_prompt, &self.device)?;
        let context = Tensor::cat(&[context, context_uncond], 0)?;
        let y = Tensor::cat(&[y, y_uncond], 0)?;

        let mut images = Vec::with_capacity(request.num_images);
        for index in 0..request.num_images {
            let latent = sampling::euler_sample(
                &self.mmdit,
                &y,
                &context,
                request.steps,
                request.guidance,
                sampling::DEFAULT_TIME_SHIFT,
                request.height,
                request.width,
                request.noise_frac,
            )?;
            let decoded = self.vae.decode(&((latent / 1.5305)? + 0.0609)?)?;
            let image = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
            images.push(tensor_to_image(&image.i(0)?)?);
            tracing::debug!(index, "decoded image");
        }
        Ok(images)
    }
}

pub struct Sd3Loader;

impl Loader for Sd3Loader {
    type Pipeline = Sd3Pipeline;

    async fn load(variant: Sd3Variant, api: Api, device_map: DeviceMap) -> Result<Sd3Pipeline> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = DType::F16;

        let files = TextEncoderFiles {
            clip_l_tokenizer: fetch(&api, CLIP_L_TOKENIZER).await?,
            clip_g_tokenizer: fetch(&api, CLIP_G_TOKENIZER).await?,
            t5_config: fetch(&api, T5_CONFIG).await?,
            t5_tokenizer: fetch(&api, T5_TOKENIZER).await?,
        };

        let (text, vb) = match variant {
            Sd3Variant::Medium => {
                let weights = fetch(&api, Artifact::new(SD3_MEDIUM_REPO, SD3_MEDIUM_FILE)).await?;
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[weights], dtype, &device)
                        .context("failed to mmap model weights")?
                };
                let text = TripleClip::from_single_file(vb.pp("text_encoders"), &files)?;
                (text, vb)
            }
            Sd3Variant::ThreeFiveLarge | Sd3Variant::ThreeFiveLargeTurbo => {
                let (weights_repo, weights_file) = match variant {
                    Sd3Variant::ThreeFiveLarge => (SD3_5_LARGE_REPO, SD3_5_LARGE_FILE),
                    _ => (SD3_5_LARGE_TURBO_REPO, SD3_5_LARGE_TURBO_FILE),
                };
                let weights = fetch(&api, Artifact::new(weights_repo, weights_file)).await?;
                let clip_g = fetch(&api, Artifact::new(SPLIT_CLIP_REPO, SPLIT_CLIP_G_FILE)).await?;
                let clip_l = fetch(&api, Artifact::new(SPLIT_CLIP_REPO, SPLIT_CLIP_L_FILE)).await?;
                let t5 = fetch(&api, Artifact::new(SPLIT_CLIP_REPO, SPLIT_T5_FILE)).await?;
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[weights], dtype, &device)
                        .context("failed to mmap model weights")?
                };
                let text = TripleClip::from_split_files(&clip_g, &clip_l, &t5, &files, &device)?;
                (text, vb)
            }
        };

        let mmdit = MMDiT::new(
            &variant.mmdit_config(),
            cfg!(feature = "flash-attn"),
            vb.pp("model.diffusion_model"),
        )
        .context("failed to build the diffusion transformer")?;
        let vae = vae::build_vae(vb.pp("first_stage_model"))?;

        Ok(Sd3Pipeline {
            device,
            text,
            mmdit,
            vae,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_medium_from_repo_name() {
        assert_eq!(
            Sd3Variant::from_name("stabilityai/stable-diffusion-3-medium"),
            Some(Sd3Variant::Medium)
        );
        assert_eq!(Sd3Variant::from_name("sd3-medium"), Some(Sd3Variant::Medium));
    }

    #[test]
    fn detects_the_three_five_family() {
        assert_eq!(
            Sd3Variant::from_name("stabilityai/stable-diffusion-3.5-large"),
            Some(Sd3Variant::ThreeFiveLarge)
        );
        assert_eq!(
            Sd3Variant::from_name("stabilityai/stable-diffusion-3.5-large-turbo"),
            Some(Sd3Variant::ThreeFiveLargeTurbo)
        );
    }

    #[test]
    fn rejects_unrelated_models() {
        assert_eq!(Sd3Variant::from_name("black-forest-labs/FLUX.1-schnell"), None);
    }

    #[test]
    fn artifacts_cover_weights_and_text_encoders() {
        let artifacts = Sd3Variant::Medium.artifacts();
        assert!(artifacts
            .iter()
            .any(|artifact| artifact.filename == SD3_MEDIUM_FILE));
        assert!(artifacts.contains(&T5_TOKENIZER));
        assert!(artifacts.contains(&CLIP_L_TOKENIZER));
    }

    #[test]
    fn variant_names_round_trip() {
        let variant: Sd3Variant = "3.5-large".parse().unwrap();
        assert_eq!(variant, Sd3Variant::ThreeFiveLarge);
        assert_eq!(Sd3Variant::Medium.to_string(), "3-medium");
    }
}
