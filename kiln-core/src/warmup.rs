use anyhow::{Context, Result};
use hf_hub::api::tokio::Api;

use crate::{retry::RetryPolicy, sd3::Sd3Variant};

/// Ensures every artifact the loader will read is present in the local
/// model-hub cache, retrying each fetch per `policy` and re-raising the
/// final failure. Idempotent; already-cached files resolve immediately.
///
/// This is a pre-deployment step: the serving path never calls it.
pub async fn prefetch(variant: Sd3Variant, api: &Api, policy: &RetryPolicy) -> Result<()> {
    for artifact in variant.artifacts() {
        tracing::info!(%artifact, "prefetching");
        policy
            .run(move || async move {
                api.repo(artifact.repo())
                    .get(artifact.filename)
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        tracing::warn!(%artifact, %err, "fetch attempt failed");
                        err
                    })
            })
            .await
            .with_context(|| format!("failed to prefetch {artifact}"))?;
    }
    Ok(())
}
