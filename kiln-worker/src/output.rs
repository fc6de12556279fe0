use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;

use crate::bucket::BucketClient;

pub struct OutputConfig {
    pub root: PathBuf,
    pub bucket: Option<BucketClient>,
}

impl OutputConfig {
    pub fn from_env(root: PathBuf) -> Result<Self> {
        Ok(Self {
            root,
            bucket: BucketClient::from_env()?,
        })
    }
}

/// Job-scoped scratch directory, removed with its contents on drop so no
/// exit path leaves files behind.
pub struct JobDir {
    path: PathBuf,
}

impl JobDir {
    pub fn create(root: &Path, job_id: &str) -> Result<Self> {
        let path = root.join(job_id);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create job dir {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn save_png(&self, index: usize, image: &DynamicImage) -> Result<PathBuf> {
        let path = self.path.join(format!("{index}.png"));
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("failed to save {}", path.display()))?;
        Ok(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to remove job dir");
        }
    }
}

pub fn data_uri(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(format!(
        "data:image/png;base64,{}",
        BASE64_STANDARD.encode(bytes)
    ))
}

/// Writes every image into a job-scoped directory and turns each into a
/// bucket URL or an inline data URI. The directory is gone by the time this
/// returns, on the error path included.
pub async fn persist_images(
    images: &[DynamicImage],
    job_id: &str,
    config: &OutputConfig,
) -> Result<Vec<String>> {
    let dir = JobDir::create(&config.root, job_id)?;
    let mut urls = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let path = dir.save_png(index, image)?;
        let url = match &config.bucket {
            Some(bucket) => bucket.upload_png(job_id, index, &path).await?,
            None => data_uri(&path)?,
        };
        urls.push(url);
    }
    Ok(urls)
}
