use anyhow::{Context, Result};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};

/// SD3 autoencoder: 16 latent channels, no quant convolutions.
pub fn build_vae(vb: VarBuilder) -> Result<AutoEncoderKL> {
    let config = AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 16,
        norm_num_groups: 32,
        use_quant_conv: false,
        use_post_quant_conv: false,
    };
    AutoEncoderKL::new(vb, 3, 3, config).context("failed to build the autoencoder")
}
