use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Bucket settings, straight from the environment. `BUCKET_ENDPOINT_URL`
/// selects upload mode; without it the worker answers with data URIs.
#[derive(Debug, Clone, Deserialize)]
struct BucketEnv {
    bucket_endpoint_url: Option<String>,
    bucket_access_key_id: Option<String>,
    bucket_secret_access_key: Option<String>,
}

pub struct BucketClient {
    endpoint_url: String,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    client: reqwest::Client,
}

impl BucketClient {
    /// Returns `None` when no bucket endpoint is configured.
    pub fn from_env() -> Result<Option<Self>> {
        let env = envy::from_env::<BucketEnv>().context("failed to read bucket environment")?;
        let Some(endpoint_url) = env.bucket_endpoint_url else {
            return Ok(None);
        };
        Ok(Some(Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            access_key_id: env.bucket_access_key_id,
            secret_access_key: env.bucket_secret_access_key,
            client: reqwest::Client::new(),
        }))
    }

    /// Uploads one image under `<endpoint>/<job_id>/<index>.png` and returns
    /// its URL. Failures propagate to the caller.
    pub async fn upload_png(&self, job_id: &str, index: usize, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let url = format!("{}/{}/{}.png", self.endpoint_url, job_id, index);

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(bytes);
        if let (Some(key), Some(secret)) = (&self.access_key_id, &self.secret_access_key) {
            request = request.basic_auth(key, Some(secret));
        }

        request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("failed to upload {url}"))?;

        tracing::info!(%url, "uploaded image");
        Ok(url)
    }
}
