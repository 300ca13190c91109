//! Device resolution and the per-batch forward strategy.
//!
//! With a single device the model is invoked directly. With several, the
//! batch is manually partitioned into equal shards, the parameters are
//! replicated per device, and the shard outputs are gathered back on the
//! primary device in batch order. The sharded path is a compatibility shim
//! around the lack of automatic multi-device dispatch in the tensor runtime;
//! it lives behind this interface so it can be dropped wholesale.

use candle_core::{Device, Result, Tensor};

use crate::error::{TrainError, TrainResult};
use crate::model::WaveRnn;

/// Pick the compute device: the first GPU if one is available and not
/// explicitly disabled, otherwise the CPU.
pub fn resolve_device(force_cpu: bool) -> TrainResult<Device> {
    if !force_cpu && candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Forward execution strategy for one run.
#[derive(Debug)]
pub enum ForwardPlan {
    Single(Device),
    Sharded { devices: Vec<Device> },
}

impl ForwardPlan {
    /// Build the plan, failing fast on a batch size the shard count cannot
    /// divide so a misconfigured run never starts.
    pub fn new(primary: Device, data_parallel: usize, batch_size: usize) -> TrainResult<Self> {
        if data_parallel <= 1 {
            return Ok(ForwardPlan::Single(primary));
        }
        if !batch_size.is_multiple_of(data_parallel) {
            return Err(TrainError::InvalidBatchSize {
                batch_size,
                device_count: data_parallel,
            });
        }

        let devices = match primary {
            Device::Cpu => vec![Device::Cpu; data_parallel],
            _ => (0..data_parallel)
                .map(Device::new_cuda)
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(ForwardPlan::Sharded { devices })
    }

    pub fn primary(&self) -> &Device {
        match self {
            ForwardPlan::Single(device) => device,
            ForwardPlan::Sharded { devices } => &devices[0],
        }
    }

    pub fn device_count(&self) -> usize {
        match self {
            ForwardPlan::Single(_) => 1,
            ForwardPlan::Sharded { devices } => devices.len(),
        }
    }

    /// Run the model over a batch according to the plan.
    ///
    /// The sharded path blocks until every shard completes and returns the
    /// concatenated outputs in original batch order.
    pub fn forward(&self, model: &WaveRnn, x: &Tensor, mels: &Tensor) -> TrainResult<Tensor> {
        match self {
            ForwardPlan::Single(_) => Ok(model.forward(x, mels)?),
            ForwardPlan::Sharded { devices } => {
                let n = devices.len();
                let batch = x.dim(0)?;
                if !batch.is_multiple_of(n) {
                    return Err(TrainError::InvalidBatchSize {
                        batch_size: batch,
                        device_count: n,
                    });
                }
                let shard = batch / n;
                let primary = &devices[0];

                let mut outputs = Vec::with_capacity(n);
                for (i, device) in devices.iter().enumerate() {
                    let xs = x.narrow(0, i * shard, shard)?.to_device(device)?;
                    let ms = mels.narrow(0, i * shard, shard)?.to_device(device)?;
                    let out = if i == 0 {
                        model.forward(&xs, &ms)?
                    } else {
                        model.replicate_to(device)?.forward(&xs, &ms)?
                    };
                    outputs.push(out.to_device(primary)?);
                }
                Ok(Tensor::cat(&outputs, 0)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainConfig;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn test_batch_divisibility_validation() {
        assert!(ForwardPlan::new(Device::Cpu, 2, 32).is_ok());

        let err = ForwardPlan::new(Device::Cpu, 2, 33).unwrap_err();
        match err {
            TrainError::InvalidBatchSize {
                batch_size,
                device_count,
            } => {
                assert_eq!(batch_size, 33);
                assert_eq!(device_count, 2);
            }
            other => panic!("expected InvalidBatchSize, got {other}"),
        }
    }

    #[test]
    fn test_single_device_skips_validation() {
        // One device imposes no divisibility constraint.
        let plan = ForwardPlan::new(Device::Cpu, 1, 33).unwrap();
        assert_eq!(plan.device_count(), 1);
    }

    #[test]
    fn test_sharded_matches_single() -> TrainResult<()> {
        let config = TrainConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = WaveRnn::new(&config, vb)?;

        let x = Tensor::randn(0.0f32, 0.1, (4, config.seq_len), &device)?;
        let mels = Tensor::randn(
            0.0f32,
            1.0,
            (4, config.num_mels, config.mel_window()),
            &device,
        )?;

        let single = ForwardPlan::Single(device.clone()).forward(&model, &x, &mels)?;
        let sharded = ForwardPlan::new(device, 2, 4)?.forward(&model, &x, &mels)?;

        assert_eq!(single.dims(), sharded.dims());
        let a = single.flatten_all()?.to_vec1::<f32>()?;
        let b = sharded.flatten_all()?.to_vec1::<f32>()?;
        for (lhs, rhs) in a.iter().zip(b.iter()) {
            assert!((lhs - rhs).abs() < 1e-5);
        }
        Ok(())
    }
}
