use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{sd3::Sd3Variant, DeviceMap, TextToImage};

pub trait Loader {
    type Pipeline: TextToImage;

    fn load(
        variant: Sd3Variant,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Pipeline>>
    where
        Self: Sized;
}
