//! Objective selection and tensor shape policy per output mode.
//!
//! The objective is a pure function of the model's mode, chosen once at
//! construction: `Raw` pairs categorical cross-entropy with a
//! transpose-and-unsqueeze reshape of the prediction, `Mol` pairs the
//! discretized mixture-of-logistics likelihood with a float cast of the
//! target. Both receive the target with a trailing singleton dimension.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::config::ModelMode;

/// Mixture components emitted in Mol mode (3 parameters each).
pub const N_MIXTURES: usize = 10;

/// Quantization levels assumed by the mixture-of-logistics likelihood.
const MOL_NUM_CLASSES: f64 = 65536.0;

/// Floor on predicted log-scales, ln(1e-14).
pub(crate) const LOG_SCALE_MIN: f64 = -32.23619130191664;

/// Loss function + reshape policy for one output-distribution mode.
#[derive(Debug, Clone, Copy)]
pub enum Objective {
    Raw { n_classes: usize },
    Mol,
}

impl Objective {
    pub fn for_mode(mode: ModelMode, bits: usize) -> Self {
        match mode {
            ModelMode::Raw => Objective::Raw {
                n_classes: 1 << bits,
            },
            ModelMode::Mol => Objective::Mol,
        }
    }

    /// Apply the mode's reshape policy.
    ///
    /// Raw: prediction `[B, T, C]` becomes `[B, C, T, 1]`, the integer target
    /// gains a trailing singleton `[B, T, 1]`. Mol: the prediction is left
    /// untouched and the target is cast to f32 before gaining its singleton.
    pub fn prepare(&self, y_hat: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        match self {
            Objective::Raw { .. } => {
                let y_hat = y_hat.transpose(1, 2)?.unsqueeze(3)?;
                let y = y.unsqueeze(2)?;
                Ok((y_hat, y))
            }
            Objective::Mol => {
                let y = y.to_dtype(DType::F32)?.unsqueeze(2)?;
                Ok((y_hat.clone(), y))
            }
        }
    }

    /// Reshape per mode and compute the scalar loss.
    pub fn loss(&self, y_hat: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (y_hat, y) = self.prepare(y_hat, y)?;
        match self {
            Objective::Raw { n_classes } => {
                // [B, C, T, 1] / [B, T, 1] -> flat rows for the CE kernel
                let (b, c, t, _) = y_hat.dims4()?;
                debug_assert_eq!(c, *n_classes);
                let logits = y_hat
                    .permute((0, 2, 3, 1))?
                    .contiguous()?
                    .reshape((b * t, c))?;
                let targets = y.reshape(b * t)?;
                candle_nn::loss::cross_entropy(&logits, &targets)
            }
            Objective::Mol => discretized_mix_logistic_loss(&y_hat, &y),
        }
    }
}

/// Negative log-likelihood of a discretized mixture of logistics.
///
/// `y_hat` is `[B, T, 3*M]` (mixture logits, means, log-scales), `y` is
/// `[B, T, 1]` in [-1, 1]. Bucket edges follow the 16-bit discretization,
/// with the standard edge cases at the ends of the range and a PDF
/// approximation where the CDF difference underflows.
pub fn discretized_mix_logistic_loss(y_hat: &Tensor, y: &Tensor) -> Result<Tensor> {
    let (b, t, c) = y_hat.dims3()?;
    assert!(c % 3 == 0, "mixture parameters must come in triples");
    let m = c / 3;

    let logit_probs = y_hat.narrow(2, 0, m)?;
    let means = y_hat.narrow(2, m, m)?;
    let log_scales = y_hat.narrow(2, 2 * m, m)?.maximum(LOG_SCALE_MIN)?;

    let y = y.broadcast_as((b, t, m))?;
    let centered = (&y - &means)?;
    let inv_stdv = log_scales.neg()?.exp()?;

    let half_bucket = 1.0 / (MOL_NUM_CLASSES - 1.0);
    let plus_in = (&inv_stdv * (&centered + half_bucket)?)?;
    let min_in = (&inv_stdv * (&centered - half_bucket)?)?;

    let cdf_plus = candle_nn::ops::sigmoid(&plus_in)?;
    let cdf_min = candle_nn::ops::sigmoid(&min_in)?;

    // log CDF at the right edge (used for y ~ -1)
    let log_cdf_plus = (&plus_in - softplus(&plus_in)?)?;
    // log (1 - CDF) at the left edge (used for y ~ +1)
    let log_one_minus_cdf_min = softplus(&min_in)?.neg()?;

    let cdf_delta = (&cdf_plus - &cdf_min)?;
    let mid_in = (&inv_stdv * &centered)?;
    let log_pdf_mid = ((&mid_in - &log_scales)? - (softplus(&mid_in)? * 2.0)?)?;

    let log_delta = cdf_delta.maximum(1e-12)?.log()?;
    let pdf_approx = (log_pdf_mid - ((MOL_NUM_CLASSES - 1.0) / 2.0).ln())?;
    let inner = cdf_delta.gt(1e-5)?.where_cond(&log_delta, &pdf_approx)?;
    let inner = y.gt(0.999)?.where_cond(&log_one_minus_cdf_min, &inner)?;
    let cond = y.lt(-0.999)?.where_cond(&log_cdf_plus, &inner)?;

    let log_probs = (cond + log_softmax(&logit_probs, D::Minus1)?)?;
    log_sum_exp(&log_probs)?.mean_all()?.neg()
}

/// Numerically stable softplus: max(x, 0) + ln(1 + exp(-|x|)).
fn softplus(x: &Tensor) -> Result<Tensor> {
    let linear = x.relu()?;
    let log_part = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    linear + log_part
}

/// Log-sum-exp over the last dimension.
fn log_sum_exp(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let sum = x.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?;
    (sum.log()? + max)?.squeeze(D::Minus1)
}
