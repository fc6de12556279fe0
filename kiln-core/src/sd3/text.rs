use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::{stable_diffusion, t5};
use tokenizers::Tokenizer;

const MAX_POSITION_EMBEDDINGS: usize = 77;

/// On-disk auxiliary artifacts the text encoders need besides their weights.
pub struct TextEncoderFiles {
    pub clip_l_tokenizer: PathBuf,
    pub clip_g_tokenizer: PathBuf,
    pub t5_config: PathBuf,
    pub t5_tokenizer: PathBuf,
}

struct ClipWithTokenizer {
    clip: stable_diffusion::clip::ClipTextTransformer,
    config: stable_diffusion::clip::Config,
    tokenizer: Tokenizer,
}

impl ClipWithTokenizer {
    fn new(
        vb: VarBuilder,
        config: stable_diffusion::clip::Config,
        tokenizer_file: &Path,
    ) -> Result<Self> {
        let clip = stable_diffusion::clip::ClipTextTransformer::new(vb, &config)
            .context("failed to build CLIP text transformer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        Ok(Self {
            clip,
            config,
            tokenizer,
        })
    }

    /// Returns the penultimate-layer embeddings and the pooled embedding at
    /// the eos position.
    fn encode(&self, prompt: &str, device: &Device) -> Result<(Tensor, Tensor)> {
        let pad_token = self.config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *self
            .tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| Error::msg("failed to resolve the CLIP padding token"))?;

        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let eos_position = tokens.len() - 1;
        tokens.resize(MAX_POSITION_EMBEDDINGS, pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;

        let (embeddings, penultimate) = self
            .clip
            .forward_until_encoder_layer(&tokens, usize::MAX, -2)?;
        let pooled = embeddings.i((0, eos_position, ..))?;

        Ok((penultimate, pooled))
    }
}

struct T5WithTokenizer {
    t5: t5::T5EncoderModel,
    tokenizer: Tokenizer,
}

impl T5WithTokenizer {
    fn new(vb: VarBuilder, files: &TextEncoderFiles) -> Result<Self> {
        let config = std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let config: t5::Config =
            serde_json::from_str(&config).context("failed to parse T5 config")?;
        let t5 = t5::T5EncoderModel::load(vb, &config).context("failed to load the T5 encoder")?;
        let tokenizer = Tokenizer::from_file(&files.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;
        Ok(Self { t5, tokenizer })
    }

    fn encode(&mut self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(MAX_POSITION_EMBEDDINGS, 0);
        let input_token_ids = Tensor::new(&tokens[..], device)?.unsqueeze(0)?;
        Ok(self.t5.forward(&input_token_ids)?)
    }
}

/// The SD3 text-conditioning stack: CLIP-L and CLIP-G penultimate
/// embeddings concatenated and zero-padded to the T5 width, T5-XXL
/// embeddings appended along the sequence axis, pooled CLIP outputs joined
/// into the conditioning vector.
pub struct TripleClip {
    clip_l: ClipWithTokenizer,
    clip_g: ClipWithTokenizer,
    clip_g_text_projection: candle_nn::Linear,
    t5: T5WithTokenizer,
}

impl TripleClip {
    /// Builds from a checkpoint that bundles all text encoders, positioned
    /// at its `text_encoders` prefix.
    pub fn from_single_file(vb: VarBuilder, files: &TextEncoderFiles) -> Result<Self> {
        let clip_l = ClipWithTokenizer::new(
            vb.pp("clip_l.transformer"),
            stable_diffusion::clip::Config::sdxl(),
            &files.clip_l_tokenizer,
        )?;
        let clip_g = ClipWithTokenizer::new(
            vb.pp("clip_g.transformer"),
            stable_diffusion::clip::Config::sdxl2(),
            &files.clip_g_tokenizer,
        )?;
        let clip_g_text_projection = candle_nn::linear_no_bias(
            1280,
            1280,
            vb.pp("clip_g.transformer.text_projection"),
        )
        .context("failed to build the CLIP-G text projection")?;
        let t5 = T5WithTokenizer::new(vb.pp("t5xxl.transformer"), files)?;
        Ok(Self {
            clip_l,
            clip_g,
            clip_g_text_projection,
            t5,
        })
    }

    /// Builds from checkpoints that ship each text encoder separately.
    pub fn from_split_files(
        clip_g_weights: &Path,
        clip_l_weights: &Path,
        t5_weights: &Path,
        files: &TextEncoderFiles,
        device: &Device,
    ) -> Result<Self> {
        let vb_clip_g = unsafe {
            VarBuilder::from_mmaped_safetensors(&[clip_g_weights], DType::F16, device)
                .context("failed to mmap CLIP-G weights")?
        };
        let vb_clip_l = unsafe {
            VarBuilder::from_mmaped_safetensors(&[clip_l_weights], DType::F16, device)
                .context("failed to mmap CLIP-L weights")?
        };
        let vb_t5 = unsafe {
            VarBuilder::from_mmaped_safetensors(&[t5_weights], DType::F32, device)
                .context("failed to mmap T5 weights")?
        };

        let clip_l = ClipWithTokenizer::new(
            vb_clip_l,
            stable_diffusion::clip::Config::sdxl(),
            &files.clip_l_tokenizer,
        )?;
        let clip_g_text_projection =
            candle_nn::linear_no_bias(1280, 1280, vb_clip_g.pp("text_projection"))
                .context("failed to build the CLIP-G text projection")?;
        let clip_g = ClipWithTokenizer::new(
            vb_clip_g,
            stable_diffusion::clip::Config::sdxl2(),
            &files.clip_g_tokenizer,
        )?;
        let t5 = T5WithTokenizer::new(vb_t5, files)?;
        Ok(Self {
            clip_l,
            clip_g,
            clip_g_text_projection,
            t5,
        })
    }

    /// Returns the sequence context and the pooled conditioning vector.
    pub fn encode(&mut self, prompt: &str, device: &Device) -> Result<(Tensor, Tensor)> {
        let (clip_l_embeddings, clip_l_pooled) = self.clip_l.encode(prompt, device)?;
        let (clip_g_embeddings, clip_g_pooled) = self.clip_g.encode(prompt, device)?;

        let clip_g_pooled = self
            .clip_g_text_projection
            .forward(&clip_g_pooled.unsqueeze(0)?)?
            .squeeze(0)?;

        let y = Tensor::cat(&[&clip_l_pooled, &clip_g_pooled], 0)?.unsqueeze(0)?;
        let clip_embeddings = Tensor::cat(&[&clip_l_embeddings, &clip_g_embeddings], D::Minus1)?
            .pad_with_zeros(D::Minus1, 0, 2048)?;

        let t5_embeddings = self.t5.encode(prompt, device)?.to_dtype(DType::F16)?;
        let context = Tensor::cat(&[&clip_embeddings, &t5_embeddings], D::Minus2)?;

        Ok((context, y))
    }
}
