use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_transformers::models::{flux, mmdit::model::MMDiT};

/// Time-SNR shift used by the SD3 reference sampler.
pub const DEFAULT_TIME_SHIFT: f64 = 3.0;

/// Resolution-shifted sigma schedule for `steps` denoising steps, truncated
/// at the `noise_frac` cutoff. At least one integration window is kept.
pub fn sigma_schedule(steps: usize, time_shift: f64, noise_frac: f64) -> Vec<f64> {
    let sigmas: Vec<f64> = (0..=steps)
        .map(|step| step as f64 / steps as f64)
        .rev()
        .map(|sigma| time_snr_shift(time_shift, sigma))
        .collect();
    let windows = ((steps as f64) * noise_frac).round() as usize;
    let keep = windows.clamp(1, steps) + 1;
    sigmas[..keep].to_vec()
}

fn time_snr_shift(alpha: f64, t: f64) -> f64 {
    alpha * t / (1.0 + (alpha - 1.0) * t)
}

fn apply_cfg(cfg_scale: f64, noise_pred: &Tensor) -> Result<Tensor> {
    Ok(((cfg_scale * noise_pred.narrow(0, 0, 1)?)?
        - ((cfg_scale - 1.0) * noise_pred.narrow(0, 1, 1)?)?)?)
}

/// Euler integration of the probability flow, with the conditioned and
/// unconditioned halves batched together for classifier-free guidance.
#[allow(clippy::too_many_arguments)]
pub fn euler_sample(
    mmdit: &MMDiT,
    y: &Tensor,
    context: &Tensor,
    steps: usize,
    cfg_scale: f64,
    time_shift: f64,
    height: usize,
    width: usize,
    noise_frac: f64,
) -> Result<Tensor> {
    let mut x =
        flux::sampling::get_noise(1, height, width, context.device())?.to_dtype(DType::F16)?;
    let sigmas = sigma_schedule(steps, time_shift, noise_frac);

    for window in sigmas.windows(2) {
        let (s_curr, s_prev) = match window {
            [a, b] => (*a, *b),
            _ => continue,
        };
        let timestep = (s_curr * 1000.0) as f32;
        let noise_pred = mmdit.forward(
            &Tensor::cat(&[&x, &x], 0)?,
            &Tensor::full(timestep, (2,), x.device())?.contiguous()?,
            y,
            context,
            None,
        )?;
        let guidance = apply_cfg(cfg_scale, &noise_pred)?;
        x = (x + (guidance * (s_prev - s_curr))?)?;
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_schedule_spans_one_to_zero() {
        let sigmas = sigma_schedule(28, DEFAULT_TIME_SHIFT, 1.0);
        assert_eq!(sigmas.len(), 29);
        assert!((sigmas[0] - 1.0).abs() < 1e-12);
        assert!(sigmas[28].abs() < 1e-12);
    }

    #[test]
    fn schedule_is_strictly_decreasing() {
        let sigmas = sigma_schedule(10, DEFAULT_TIME_SHIFT, 1.0);
        for window in sigmas.windows(2) {
            assert!(window[0] > window[1]);
        }
    }

    #[test]
    fn noise_frac_truncates_the_schedule() {
        let sigmas = sigma_schedule(20, DEFAULT_TIME_SHIFT, 0.5);
        assert_eq!(sigmas.len(), 11);
        assert!(sigmas.last().unwrap() > &0.0);
    }

    #[test]
    fn tiny_noise_frac_keeps_one_window() {
        let sigmas = sigma_schedule(20, DEFAULT_TIME_SHIFT, 0.001);
        assert_eq!(sigmas.len(), 2);
    }

    #[test]
    fn shift_leaves_endpoints_fixed() {
        assert_eq!(time_snr_shift(3.0, 0.0), 0.0);
        assert_eq!(time_snr_shift(3.0, 1.0), 1.0);
        assert!(time_snr_shift(3.0, 0.5) > 0.5);
    }
}
