use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, Loader, Sd3Loader, Sd3Variant, TextToImage};

/// Load a pipeline based on its model name, detecting the variant.
pub async fn load_pipeline(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Box<dyn TextToImage>> {
    let variant = Sd3Variant::from_name(model_name)
        .ok_or_else(|| anyhow!("unsupported model: {}", model_name))?;

    tracing::info!(model = %model_name, ?variant, "loading pipeline");

    let pipeline = Sd3Loader::load(variant, api, device_map).await?;
    Ok(Box::new(pipeline))
}
