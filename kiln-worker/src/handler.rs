use anyhow::{Context, Result};
use kiln_core::{schema, TextToImage};
use serde::{Deserialize, Serialize};

use crate::output::{self, OutputConfig};

/// One unit of work as submitted by the job runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum JobResult {
    Images {
        images: Vec<String>,
        image_url: String,
        seed: u64,
    },
    Error {
        error: Vec<String>,
    },
}

/// Runs one job against the resident pipeline: validate, resolve the seed,
/// generate, persist. Validation failures come back as a structured error
/// result; pipeline and upload failures propagate to the caller.
pub async fn handle_job(
    pipeline: &mut dyn TextToImage,
    job: &Job,
    output: &OutputConfig,
) -> Result<JobResult> {
    let input = match schema::validate(&job.input) {
        Ok(input) => input,
        Err(errors) => {
            tracing::info!(job_id = %job.id, ?errors, "rejected job input");
            return Ok(JobResult::Error { error: errors });
        }
    };

    // Seed resolution happens at request time, not validation time.
    let seed = input.seed.unwrap_or_else(schema::draw_seed);
    let request = input.into_request(seed);

    tracing::info!(job_id = %job.id, seed, num_images = request.num_images, "generating");
    let images = pipeline.run(&request)?;

    let urls = output::persist_images(&images, &job.id, output).await?;
    let image_url = urls
        .first()
        .cloned()
        .context("pipeline returned no images")?;

    Ok(JobResult::Images {
        images: urls,
        image_url,
        seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{prelude::BASE64_STANDARD, Engine};
    use image::DynamicImage;
    use kiln_core::GenerationRequest;
    use serde_json::json;
    use tempfile::tempdir;

    struct FakePipeline {
        calls: usize,
    }

    impl FakePipeline {
        fn new() -> Self {
            Self { calls: 0 }
        }
    }

    impl TextToImage for FakePipeline {
        fn run(&mut self, request: &GenerationRequest) -> Result<Vec<DynamicImage>> {
            self.calls += 1;
            Ok((0..request.num_images)
                .map(|_| DynamicImage::ImageRgb8(image::RgbImage::new(8, 8)))
                .collect())
        }
    }

    fn job(id: &str, input: serde_json::Value) -> Job {
        Job {
            id: id.to_string(),
            input,
        }
    }

    fn config(root: &std::path::Path) -> OutputConfig {
        OutputConfig {
            root: root.to_path_buf(),
            bucket: None,
        }
    }

    #[tokio::test]
    async fn missing_prompt_never_reaches_the_pipeline() {
        let root = tempdir().unwrap();
        let mut pipeline = FakePipeline::new();
        let result = handle_job(
            &mut pipeline,
            &job("job-0", json!({ "height": 512 })),
            &config(root.path()),
        )
        .await
        .unwrap();
        match result {
            JobResult::Error { error } => assert!(error[0].contains("prompt")),
            other => panic!("expected an error result, got {other:?}"),
        }
        assert_eq!(pipeline.calls, 0);
        assert!(!root.path().join("job-0").exists());
    }

    #[tokio::test]
    async fn explicit_seed_is_echoed_back() {
        let root = tempdir().unwrap();
        let mut pipeline = FakePipeline::new();
        let result = handle_job(
            &mut pipeline,
            &job("job-1", json!({ "prompt": "a cat", "seed": 42, "num_images": 1 })),
            &config(root.path()),
        )
        .await
        .unwrap();
        match result {
            JobResult::Images {
                images,
                image_url,
                seed,
            } => {
                assert_eq!(seed, 42);
                assert_eq!(images.len(), 1);
                assert_eq!(image_url, images[0]);
            }
            other => panic!("expected images, got {other:?}"),
        }
        assert_eq!(pipeline.calls, 1);
    }

    #[tokio::test]
    async fn absent_seed_draws_two_bytes() {
        let root = tempdir().unwrap();
        let mut pipeline = FakePipeline::new();
        let result = handle_job(
            &mut pipeline,
            &job("job-2", json!({ "prompt": "a cat" })),
            &config(root.path()),
        )
        .await
        .unwrap();
        match result {
            JobResult::Images { seed, .. } => assert!(seed < 65536),
            other => panic!("expected images, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn num_images_is_honored_and_first_is_duplicated() {
        let root = tempdir().unwrap();
        let mut pipeline = FakePipeline::new();
        let result = handle_job(
            &mut pipeline,
            &job("job-3", json!({ "prompt": "a cat", "num_images": 3 })),
            &config(root.path()),
        )
        .await
        .unwrap();
        match result {
            JobResult::Images {
                images, image_url, ..
            } => {
                assert_eq!(images.len(), 3);
                assert_eq!(image_url, images[0]);
            }
            other => panic!("expected images, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn without_a_bucket_outputs_are_valid_data_uris() {
        let root = tempdir().unwrap();
        let mut pipeline = FakePipeline::new();
        let result = handle_job(
            &mut pipeline,
            &job("job-4", json!({ "prompt": "a cat", "num_images": 2 })),
            &config(root.path()),
        )
        .await
        .unwrap();
        let JobResult::Images { images, .. } = result else {
            panic!("expected images");
        };
        for uri in &images {
            let payload = uri
                .strip_prefix("data:image/png;base64,")
                .expect("data uri prefix");
            BASE64_STANDARD.decode(payload).expect("valid base64");
        }
    }

    #[tokio::test]
    async fn job_scratch_dir_is_gone_afterwards() {
        let root = tempdir().unwrap();
        let mut pipeline = FakePipeline::new();
        handle_job(
            &mut pipeline,
            &job("job-5", json!({ "prompt": "a cat" })),
            &config(root.path()),
        )
        .await
        .unwrap();
        assert!(!root.path().join("job-5").exists());
    }

    #[tokio::test]
    async fn result_serializes_to_the_wire_shape() {
        let root = tempdir().unwrap();
        let mut pipeline = FakePipeline::new();
        let result = handle_job(
            &mut pipeline,
            &job("job-6", json!({ "prompt": "a cat", "seed": 7 })),
            &config(root.path()),
        )
        .await
        .unwrap();
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["seed"], 7);
        assert_eq!(value["image_url"], value["images"][0]);

        let rejected = handle_job(
            &mut pipeline,
            &job("job-7", json!({})),
            &config(root.path()),
        )
        .await
        .unwrap();
        let value = serde_json::to_value(&rejected).unwrap();
        assert!(value["error"].is_array());
    }
}
