use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use validator::Validate;

use crate::GenerationRequest;

pub const DEFAULT_HEIGHT: u32 = 1024;
pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_STEPS: u32 = 28;
pub const DEFAULT_GUIDANCE: f64 = 4.5;
pub const DEFAULT_NOISE_FRAC: f64 = 1.0;
pub const DEFAULT_NUM_IMAGES: u32 = 1;

/// Raw job input as submitted by the runtime. Optional fields keep their
/// absence visible until defaults are applied in [`JobInput::into_request`].
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct JobInput {
    #[validate(length(
        min = 1,
        max = 1000,
        message = "prompt must be between 1 and 1000 characters"
    ))]
    pub prompt: String,
    #[validate(length(max = 1000, message = "negative_prompt must be at most 1000 characters"))]
    pub negative_prompt: Option<String>,
    #[validate(range(min = 256, max = 1536, message = "height must be between 256 and 1536"))]
    pub height: Option<u32>,
    #[validate(range(min = 256, max = 1536, message = "width must be between 256 and 1536"))]
    pub width: Option<u32>,
    #[validate(range(
        min = 1,
        max = 100,
        message = "num_inference_steps must be between 1 and 100"
    ))]
    pub num_inference_steps: Option<u32>,
    #[validate(range(
        min = 0.0,
        max = 20.0,
        message = "guidance_scale must be between 0 and 20"
    ))]
    pub guidance_scale: Option<f64>,
    #[validate(range(
        exclusive_min = 0.0,
        max = 1.0,
        message = "high_noise_frac must be in (0, 1]"
    ))]
    pub high_noise_frac: Option<f64>,
    #[validate(range(min = 1, max = 4, message = "num_images must be between 1 and 4"))]
    pub num_images: Option<u32>,
    pub seed: Option<u64>,
}

impl JobInput {
    /// Applies defaults and the resolved seed, producing the concrete
    /// parameters a pipeline runs with.
    pub fn into_request(self, seed: u64) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt.unwrap_or_default(),
            width: self.width.unwrap_or(DEFAULT_WIDTH) as usize,
            height: self.height.unwrap_or(DEFAULT_HEIGHT) as usize,
            steps: self.num_inference_steps.unwrap_or(DEFAULT_STEPS) as usize,
            guidance: self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE),
            noise_frac: self.high_noise_frac.unwrap_or(DEFAULT_NOISE_FRAC),
            num_images: self.num_images.unwrap_or(DEFAULT_NUM_IMAGES) as usize,
            seed,
        }
    }
}

/// Validates a raw input mapping, collecting every violation instead of
/// stopping at the first.
pub fn validate(input: &serde_json::Value) -> Result<JobInput, Vec<String>> {
    let job_input: JobInput = match serde_json::from_value(input.clone()) {
        Ok(job_input) => job_input,
        Err(err) => return Err(vec![err.to_string()]),
    };

    let mut errors = Vec::new();
    if let Err(validation_errors) = job_input.validate() {
        let mut fields: Vec<_> = validation_errors.field_errors().into_iter().collect();
        fields.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (field, field_errors) in fields {
            for error in field_errors {
                match &error.message {
                    Some(message) => errors.push(format!("{field}: {message}")),
                    None => errors.push(format!("{field}: invalid value ({})", error.code)),
                }
            }
        }
    }

    for (field, value) in [("height", job_input.height), ("width", job_input.width)] {
        if let Some(value) = value {
            if value % 64 != 0 {
                errors.push(format!("{field}: must be a multiple of 64"));
            }
        }
    }

    if errors.is_empty() {
        Ok(job_input)
    } else {
        Err(errors)
    }
}

/// Draws a seed from two OS-random bytes, big-endian. Always < 65536;
/// determinism across runs is explicitly not a goal.
pub fn draw_seed() -> u64 {
    let mut bytes = [0u8; 2];
    OsRng.fill_bytes(&mut bytes);
    u16::from_be_bytes(bytes) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_input_gets_defaults() {
        let input = validate(&json!({ "prompt": "a cat" })).unwrap();
        let request = input.into_request(42);
        assert_eq!(request.prompt, "a cat");
        assert_eq!(request.negative_prompt, "");
        assert_eq!(request.width, DEFAULT_WIDTH as usize);
        assert_eq!(request.height, DEFAULT_HEIGHT as usize);
        assert_eq!(request.steps, DEFAULT_STEPS as usize);
        assert_eq!(request.guidance, DEFAULT_GUIDANCE);
        assert_eq!(request.noise_frac, DEFAULT_NOISE_FRAC);
        assert_eq!(request.num_images, DEFAULT_NUM_IMAGES as usize);
        assert_eq!(request.seed, 42);
    }

    #[test]
    fn explicit_fields_survive() {
        let input = validate(&json!({
            "prompt": "a cat",
            "negative_prompt": "blurry",
            "height": 768,
            "width": 512,
            "num_inference_steps": 40,
            "guidance_scale": 7.0,
            "high_noise_frac": 0.8,
            "num_images": 3,
            "seed": 1234,
        }))
        .unwrap();
        assert_eq!(input.seed, Some(1234));
        let request = input.into_request(1234);
        assert_eq!(request.height, 768);
        assert_eq!(request.width, 512);
        assert_eq!(request.steps, 40);
        assert_eq!(request.guidance, 7.0);
        assert_eq!(request.noise_frac, 0.8);
        assert_eq!(request.num_images, 3);
    }

    #[test]
    fn missing_prompt_is_rejected() {
        let errors = validate(&json!({ "height": 512 })).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("prompt"), "unexpected error: {}", errors[0]);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let errors = validate(&json!({ "prompt": "" })).unwrap_err();
        assert!(errors[0].contains("prompt must be between"));
    }

    #[test]
    fn range_violations_are_collected_together() {
        let errors = validate(&json!({
            "prompt": "a cat",
            "height": 100,
            "num_inference_steps": 0,
        }))
        .unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("height must be between")));
        assert!(errors.iter().any(|e| e.contains("multiple of 64")));
        assert!(errors.iter().any(|e| e.contains("num_inference_steps")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let errors = validate(&json!({ "prompt": "a cat", "steps": 10 })).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unknown field"), "unexpected error: {}", errors[0]);
    }

    #[test]
    fn dimensions_must_align_to_64() {
        let errors = validate(&json!({ "prompt": "a cat", "width": 1000 })).unwrap_err();
        assert_eq!(errors, vec!["width: must be a multiple of 64".to_string()]);
    }

    #[test]
    fn noise_frac_of_zero_is_rejected() {
        let errors = validate(&json!({ "prompt": "a cat", "high_noise_frac": 0.0 })).unwrap_err();
        assert!(errors[0].contains("high_noise_frac"));
    }

    #[test]
    fn drawn_seeds_fit_in_two_bytes() {
        for _ in 0..64 {
            assert!(draw_seed() < 65536);
        }
    }
}
