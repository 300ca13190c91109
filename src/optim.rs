//! Adam optimizer over candle `Var`s with serializable state.
//!
//! Gradients are recomputed on every backward pass, so there is no
//! zero-grad step; clipping is applied as a scale factor on each gradient
//! at update time.

use candle_core::{backprop::GradStore, Result, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// Flat snapshot of one tensor, for optimizer-state serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorState {
    fn of(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor.flatten_all()?.to_vec1::<f32>()?,
        })
    }
}

/// Serialized Adam state: moment estimates keyed by parameter name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamState {
    pub names: Vec<String>,
    pub exp_avg: Vec<TensorState>,
    pub exp_avg_sq: Vec<TensorState>,
    pub t: usize,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

/// Adam optimizer.
///
/// Update rule per parameter:
///   m = beta1*m + (1-beta1)*g
///   v = beta2*v + (1-beta2)*g^2
///   p -= lr * (m / bc1) / (sqrt(v / bc2) + eps)
/// with bias corrections bc1/bc2 from the shared timestep.
pub struct Adam {
    params: Vec<(String, Var)>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    t: usize,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
}

impl Adam {
    /// Create an optimizer over all variables of a map.
    ///
    /// Parameters are tracked by name in sorted order so that exported state
    /// round-trips independently of map iteration order.
    pub fn new(varmap: &VarMap, lr: f64) -> Result<Self> {
        let mut params: Vec<(String, Var)> = {
            let data = varmap.data().lock().unwrap();
            data.iter()
                .map(|(name, var)| (name.clone(), var.clone()))
                .collect()
        };
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let exp_avg = params
            .iter()
            .map(|(_, v)| Tensor::zeros_like(v.as_tensor()))
            .collect::<Result<Vec<_>>>()?;
        let exp_avg_sq = params
            .iter()
            .map(|(_, v)| Tensor::zeros_like(v.as_tensor()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            params,
            exp_avg,
            exp_avg_sq,
            t: 0,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Apply one Adam update from a gradient store.
    ///
    /// `clip_scale` multiplies every gradient before the moment updates;
    /// pass 1.0 for no clipping.
    pub fn step(&mut self, grads: &GradStore, clip_scale: f64) -> Result<()> {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (i, (_, var)) in self.params.iter().enumerate() {
            let grad = match grads.get(var.as_tensor()) {
                Some(g) => g,
                None => continue,
            };
            let grad = (grad * clip_scale)?;

            let m = ((&self.exp_avg[i] * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
            let v = ((&self.exp_avg_sq[i] * self.beta2)?
                + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m / bc1)?;
            let v_hat = (&v / bc2)?;
            let denom = (v_hat.sqrt()? + self.eps)?;
            let update = ((m_hat / denom)? * self.lr)?;

            let new_val = var.as_tensor().sub(&update)?;
            var.set(&new_val)?;

            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
        }
        Ok(())
    }

    pub fn export_state(&self) -> TrainResult<AdamState> {
        let mut exp_avg = Vec::with_capacity(self.exp_avg.len());
        for tensor in &self.exp_avg {
            exp_avg.push(TensorState::of(tensor)?);
        }
        let mut exp_avg_sq = Vec::with_capacity(self.exp_avg_sq.len());
        for tensor in &self.exp_avg_sq {
            exp_avg_sq.push(TensorState::of(tensor)?);
        }

        Ok(AdamState {
            names: self.params.iter().map(|(n, _)| n.clone()).collect(),
            exp_avg,
            exp_avg_sq,
            t: self.t,
            lr: self.lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
        })
    }

    pub fn import_state(&mut self, state: &AdamState) -> TrainResult<()> {
        let names: Vec<String> = self.params.iter().map(|(n, _)| n.clone()).collect();
        if state.names != names {
            return Err(TrainError::DataLoading(format!(
                "optimizer state parameter mismatch: expected {} named parameters, got {}",
                names.len(),
                state.names.len()
            )));
        }

        let restore = |snaps: &[TensorState], params: &[(String, Var)]| -> TrainResult<Vec<Tensor>> {
            let mut out = Vec::with_capacity(snaps.len());
            for (idx, snap) in snaps.iter().enumerate() {
                let (name, var) = &params[idx];
                let expected = var.as_tensor().dims().to_vec();
                if snap.shape != expected {
                    return Err(TrainError::DataLoading(format!(
                        "optimizer state shape mismatch for '{}': expected {:?}, got {:?}",
                        name, expected, snap.shape
                    )));
                }
                out.push(Tensor::from_vec(
                    snap.data.clone(),
                    snap.shape.as_slice(),
                    var.device(),
                )?);
            }
            Ok(out)
        };

        self.exp_avg = restore(&state.exp_avg, &self.params)?;
        self.exp_avg_sq = restore(&state.exp_avg_sq, &self.params)?;
        self.t = state.t;
        self.lr = state.lr;
        self.beta1 = state.beta1;
        self.beta2 = state.beta2;
        self.eps = state.eps;
        Ok(())
    }
}

/// Compute the total L2 gradient norm across all variables.
pub fn compute_grad_norm(grads: &GradStore, varmap: &VarMap) -> Result<f64> {
    let mut total = 0.0f64;
    for var in varmap.all_vars() {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Scale factor that brings a gradient norm under the clip threshold.
///
/// A non-finite norm yields 1.0: the update proceeds unscaled, and the caller
/// is expected to log the anomaly rather than abort the run.
pub fn clip_scale(grad_norm: f64, clip: f64) -> f64 {
    if !grad_norm.is_finite() {
        return 1.0;
    }
    if grad_norm > clip {
        clip / grad_norm
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn varmap_with_weight() -> (VarMap, Tensor) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb
            .get_with_hints(16, "w", candle_nn::Init::Const(1.0))
            .unwrap();
        (varmap, w)
    }

    #[test]
    fn test_adam_step_updates_params() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, w) = varmap_with_weight();
        let orig = w.to_vec1::<f32>()?;

        let x = Tensor::randn(0.0f32, 1.0, (1, 16), &device)?;
        let y = x.broadcast_mul(&w)?;
        let loss = y.sum_all()?;
        let grads = loss.backward()?;

        let mut adam = Adam::new(&varmap, 1e-2)?;
        adam.step(&grads, 1.0)?;

        let updated = w.to_vec1::<f32>()?;
        let changed = orig
            .iter()
            .zip(updated.iter())
            .any(|(a, b)| (a - b).abs() > 1e-10);
        assert!(changed, "Parameters should change after Adam step");
        Ok(())
    }

    #[test]
    fn test_adam_state_export_import_roundtrip() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, w) = varmap_with_weight();

        let x = Tensor::randn(0.0f32, 1.0, (1, 16), &device)?;
        let y = x.broadcast_mul(&w)?;
        let loss = y.sum_all()?;
        let grads = loss.backward()?;

        let mut adam = Adam::new(&varmap, 1e-3)?;
        adam.step(&grads, 1.0)?;
        let state = adam.export_state().unwrap();
        assert_eq!(state.t, 1);

        let mut restored = Adam::new(&varmap, 1e-4)?;
        restored.import_state(&state).unwrap();
        let restored_state = restored.export_state().unwrap();

        assert_eq!(restored_state.t, state.t);
        assert_eq!(restored_state.lr, state.lr);
        assert_eq!(restored_state.names, state.names);
        assert_eq!(restored_state.exp_avg[0].data, state.exp_avg[0].data);
        Ok(())
    }

    #[test]
    fn test_import_rejects_shape_mismatch() -> Result<()> {
        let (varmap, _) = varmap_with_weight();
        let adam = Adam::new(&varmap, 1e-3)?;
        let mut state = adam.export_state().unwrap();
        state.exp_avg[0].shape = vec![8];
        state.exp_avg[0].data.truncate(8);

        let mut other = Adam::new(&varmap, 1e-3)?;
        assert!(other.import_state(&state).is_err());
        Ok(())
    }

    #[test]
    fn test_clip_scale() {
        assert_eq!(clip_scale(2.0, 4.0), 1.0);
        assert!((clip_scale(8.0, 4.0) - 0.5).abs() < 1e-12);
        // Non-finite norms never scale: the step proceeds and the caller logs.
        assert_eq!(clip_scale(f64::NAN, 4.0), 1.0);
        assert_eq!(clip_scale(f64::INFINITY, 4.0), 1.0);
    }

    #[test]
    fn test_grad_norm_known_value() -> Result<()> {
        let (varmap, w) = varmap_with_weight();
        // loss = sum(w) => dloss/dw = ones(16), norm = 4.0
        let loss = w.sum_all()?;
        let grads = loss.backward()?;
        let norm = compute_grad_norm(&grads, &varmap)?;
        assert!((norm - 4.0).abs() < 1e-5, "norm was {}", norm);
        Ok(())
    }
}
