//! WaveRNN vocoder model.
//!
//! A mel-conditioned autoregressive model: a residual convolutional
//! conditioner upsamples mel frames to sample rate, and two GRU layers with
//! residual connections drive a fully-connected head sized for the configured
//! output distribution. Layers are hand-rolled over plain tensors so the
//! whole network can be replicated onto another device for the sharded
//! forward path.

#[cfg(test)]
use candle_core::DType;
use candle_core::{bail, Device, Result, Tensor};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;
use candle_nn::ops::sigmoid;
use candle_nn::{Init, VarBuilder};

use crate::config::{ModelMode, TrainConfig};

/// Fully-connected layer over the trailing dimension.
#[derive(Debug, Clone)]
pub(crate) struct Dense {
    weight: Tensor,
    bias: Tensor,
}

impl Dense {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", DEFAULT_KAIMING_NORMAL)?;
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.broadcast_matmul(&self.weight.t()?)?
            .broadcast_add(&self.bias)
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            bias: self.bias.to_device(device)?,
        })
    }
}

/// 1-D convolution without padding.
#[derive(Debug, Clone)]
struct ConvLayer {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl ConvLayer {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        with_bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel),
            "weight",
            DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if with_bias {
            Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.conv1d(&self.weight, 0, 1, 1, 1)?;
        match &self.bias {
            Some(bias) => {
                let out = bias.dim(0)?;
                y.broadcast_add(&bias.reshape((1, out, 1))?)
            }
            None => Ok(y),
        }
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            bias: match &self.bias {
                Some(b) => Some(b.to_device(device)?),
                None => None,
            },
        })
    }
}

/// Per-channel affine normalization over the channel dimension of `[B, C, L]`.
#[derive(Debug, Clone)]
struct ChannelNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl ChannelNorm {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            eps: 1e-5,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, c, _) = x.dims3()?;
        let mu = x.mean_keepdim(1)?;
        let centered = x.broadcast_sub(&mu)?;
        let var = centered.sqr()?.mean_keepdim(1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight.reshape((1, c, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1))?)
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            bias: self.bias.to_device(device)?,
            eps: self.eps,
        })
    }
}

/// Hand-rolled GRU cell, usable both over sequences and stepwise during
/// generation.
#[derive(Debug, Clone)]
pub(crate) struct GruCell {
    wx: Dense,
    wh: Dense,
    hidden: usize,
}

impl GruCell {
    fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            wx: Dense::new(in_dim, 3 * hidden, vb.pp("wx"))?,
            wh: Dense::new(hidden, 3 * hidden, vb.pp("wh"))?,
            hidden,
        })
    }

    pub(crate) fn hidden_dim(&self) -> usize {
        self.hidden
    }

    /// One step: `x` is `[B, in]`, `h` is `[B, hidden]`.
    pub(crate) fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let gx = self.wx.forward(x)?;
        let gh = self.wh.forward(h)?;
        let d = self.hidden;

        let r = sigmoid(&(gx.narrow(1, 0, d)? + gh.narrow(1, 0, d)?)?)?;
        let z = sigmoid(&(gx.narrow(1, d, d)? + gh.narrow(1, d, d)?)?)?;
        let n = (gx.narrow(1, 2 * d, d)? + (&r * gh.narrow(1, 2 * d, d)?)?)?.tanh()?;

        // h' = (1 - z) * n + z * h
        (z.affine(-1.0, 1.0)? * &n)? + (&z * h)?
    }

    /// Run over a full sequence `[B, T, in]` from a zero state.
    fn seq(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let mut h = Tensor::zeros((b, self.hidden), x.dtype(), x.device())?;
        let mut outs = Vec::with_capacity(t);
        for i in 0..t {
            let xt = x.narrow(1, i, 1)?.squeeze(1)?;
            h = self.step(&xt, &h)?;
            outs.push(h.clone());
        }
        Tensor::stack(&outs, 1)
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            wx: self.wx.to_device(device)?,
            wh: self.wh.to_device(device)?,
            hidden: self.hidden,
        })
    }
}

/// Residual block of the mel conditioner.
#[derive(Debug, Clone)]
struct ResBlock {
    conv1: ConvLayer,
    norm1: ChannelNorm,
    conv2: ConvLayer,
    norm2: ChannelNorm,
}

impl ResBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: ConvLayer::new(channels, channels, 1, false, vb.pp("conv1"))?,
            norm1: ChannelNorm::new(channels, vb.pp("norm1"))?,
            conv2: ConvLayer::new(channels, channels, 1, false, vb.pp("conv2"))?,
            norm2: ChannelNorm::new(channels, vb.pp("norm2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let res = x;
        let x = self.norm1.forward(&self.conv1.forward(x)?)?.relu()?;
        let x = self.norm2.forward(&self.conv2.forward(&x)?)?;
        x + res
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            conv1: self.conv1.to_device(device)?,
            norm1: self.norm1.to_device(device)?,
            conv2: self.conv2.to_device(device)?,
            norm2: self.norm2.to_device(device)?,
        })
    }
}

/// Residual conv stack that turns padded mel frames into aux features.
///
/// The input convolution is unpadded, so the output loses `pad` frames on
/// each side; the data loader supplies that much extra context per window.
#[derive(Debug, Clone)]
struct MelResNet {
    conv_in: ConvLayer,
    norm_in: ChannelNorm,
    blocks: Vec<ResBlock>,
    conv_out: ConvLayer,
}

impl MelResNet {
    fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let kernel = 2 * config.pad + 1;
        let conv_in = ConvLayer::new(
            config.num_mels,
            config.compute_dims,
            kernel,
            false,
            vb.pp("conv_in"),
        )?;
        let norm_in = ChannelNorm::new(config.compute_dims, vb.pp("norm_in"))?;
        let blocks = (0..config.res_blocks)
            .map(|i| ResBlock::new(config.compute_dims, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let conv_out = ConvLayer::new(
            config.compute_dims,
            config.res_out_dims,
            1,
            true,
            vb.pp("conv_out"),
        )?;
        Ok(Self {
            conv_in,
            norm_in,
            blocks,
            conv_out,
        })
    }

    fn forward(&self, mels: &Tensor) -> Result<Tensor> {
        let mut x = self.norm_in.forward(&self.conv_in.forward(mels)?)?.relu()?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.conv_out.forward(&x)
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            conv_in: self.conv_in.to_device(device)?,
            norm_in: self.norm_in.to_device(device)?,
            blocks: self
                .blocks
                .iter()
                .map(|b| b.to_device(device))
                .collect::<Result<Vec<_>>>()?,
            conv_out: self.conv_out.to_device(device)?,
        })
    }
}

/// Nearest-neighbor stretch of `[B, C, L]` to `[B, C, L * scale]`.
fn stretch(x: &Tensor, scale: usize) -> Result<Tensor> {
    let (b, c, l) = x.dims3()?;
    x.unsqueeze(3)?
        .broadcast_as((b, c, l, scale))?
        .contiguous()?
        .reshape((b, c, l * scale))
}

/// Upsamples mel frames and aux features to sample rate.
#[derive(Debug, Clone)]
pub(crate) struct UpsampleNetwork {
    resnet: MelResNet,
    pad: usize,
    scale: usize,
}

impl UpsampleNetwork {
    fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            resnet: MelResNet::new(config, vb.pp("resnet"))?,
            pad: config.pad,
            scale: config.hop_length,
        })
    }

    /// `[B, M, F]` padded mels -> (`[B, T, M]`, `[B, T, R]`) with
    /// `T = (F - 2*pad) * hop_length`.
    pub(crate) fn forward(&self, mels: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, _, frames) = mels.dims3()?;
        if frames <= 2 * self.pad {
            bail!(
                "mel window of {frames} frames is too short for {} frames of context",
                self.pad
            );
        }
        let inner = frames - 2 * self.pad;

        let aux = stretch(&self.resnet.forward(mels)?, self.scale)?;
        let mels = stretch(&mels.narrow(2, self.pad, inner)?, self.scale)?;
        Ok((
            mels.transpose(1, 2)?.contiguous()?,
            aux.transpose(1, 2)?.contiguous()?,
        ))
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            resnet: self.resnet.to_device(device)?,
            pad: self.pad,
            scale: self.scale,
        })
    }
}

/// The WaveRNN vocoder.
pub struct WaveRnn {
    pub(crate) mode: ModelMode,
    pub(crate) bits: usize,
    pub(crate) aux_dims: usize,
    pub(crate) pad: usize,
    pub(crate) hop_length: usize,
    pub(crate) upsample: UpsampleNetwork,
    pub(crate) i: Dense,
    pub(crate) rnn1: GruCell,
    pub(crate) rnn2: GruCell,
    pub(crate) fc1: Dense,
    pub(crate) fc2: Dense,
    pub(crate) fc3: Dense,
}

impl WaveRnn {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let aux_dims = config.res_out_dims / 4;
        let rnn_dims = config.rnn_dims;

        Ok(Self {
            mode: config.mode,
            bits: config.bits,
            aux_dims,
            pad: config.pad,
            hop_length: config.hop_length,
            upsample: UpsampleNetwork::new(config, vb.pp("upsample"))?,
            i: Dense::new(config.num_mels + aux_dims + 1, rnn_dims, vb.pp("i"))?,
            rnn1: GruCell::new(rnn_dims, rnn_dims, vb.pp("rnn1"))?,
            rnn2: GruCell::new(rnn_dims + aux_dims, rnn_dims, vb.pp("rnn2"))?,
            fc1: Dense::new(rnn_dims + aux_dims, config.fc_dims, vb.pp("fc1"))?,
            fc2: Dense::new(config.fc_dims + aux_dims, config.fc_dims, vb.pp("fc2"))?,
            fc3: Dense::new(config.fc_dims, config.n_classes(), vb.pp("fc3"))?,
        })
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    /// Device the model parameters live on.
    pub fn device(&self) -> &Device {
        self.i.weight.device()
    }

    /// Training forward pass.
    ///
    /// `x` is `[B, T]` previous samples in [-1, 1], `mels` is `[B, M, F]`
    /// padded mel frames with `(F - 2*pad) * hop_length == T`. Returns
    /// `[B, T, C]` distribution parameters.
    pub fn forward(&self, x: &Tensor, mels: &Tensor) -> Result<Tensor> {
        let (_, t) = x.dims2()?;
        let (mels_up, aux) = self.upsample.forward(mels)?;
        if mels_up.dim(1)? != t {
            bail!(
                "sample window of {t} does not match {} upsampled frames",
                mels_up.dim(1)?
            );
        }

        let a = self.aux_dims;
        let a1 = aux.narrow(2, 0, a)?;
        let a2 = aux.narrow(2, a, a)?;
        let a3 = aux.narrow(2, 2 * a, a)?;
        let a4 = aux.narrow(2, 3 * a, a)?;

        let x = Tensor::cat(&[&x.unsqueeze(2)?, &mels_up, &a1], 2)?;
        let x = self.i.forward(&x)?;

        let res = x.clone();
        let x = (self.rnn1.seq(&x)? + res)?;

        let res = x.clone();
        let x = Tensor::cat(&[&x, &a2], 2)?;
        let x = (self.rnn2.seq(&x)? + res)?;

        let x = Tensor::cat(&[&x, &a3], 2)?;
        let x = self.fc1.forward(&x)?.relu()?;
        let x = Tensor::cat(&[&x, &a4], 2)?;
        let x = self.fc2.forward(&x)?.relu()?;
        self.fc3.forward(&x)
    }

    /// Build a replica of this model on another device.
    ///
    /// The replica's weights are device copies of the live parameters, so
    /// gradients computed through a replica flow back to the originals.
    pub fn replicate_to(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            mode: self.mode,
            bits: self.bits,
            aux_dims: self.aux_dims,
            pad: self.pad,
            hop_length: self.hop_length,
            upsample: self.upsample.to_device(device)?,
            i: self.i.to_device(device)?,
            rnn1: self.rnn1.to_device(device)?,
            rnn2: self.rnn2.to_device(device)?,
            fc1: self.fc1.to_device(device)?,
            fc2: self.fc2.to_device(device)?,
            fc3: self.fc3.to_device(device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn build(config: &TrainConfig) -> (VarMap, WaveRnn) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = WaveRnn::new(config, vb).unwrap();
        (varmap, model)
    }

    fn test_inputs(config: &TrainConfig, batch: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let x = Tensor::zeros((batch, config.seq_len), DType::F32, &device).unwrap();
        let mels = Tensor::randn(
            0.0f32,
            1.0,
            (batch, config.num_mels, config.mel_window()),
            &device,
        )
        .unwrap();
        (x, mels)
    }

    #[test]
    fn test_forward_shape_raw() -> Result<()> {
        let config = TrainConfig::test();
        let (_varmap, model) = build(&config);
        let (x, mels) = test_inputs(&config, 2);

        let y_hat = model.forward(&x, &mels)?;
        assert_eq!(y_hat.dims(), &[2, config.seq_len, 1 << config.bits]);
        Ok(())
    }

    #[test]
    fn test_forward_shape_mol() -> Result<()> {
        let mut config = TrainConfig::test();
        config.mode = ModelMode::Mol;
        let (_varmap, model) = build(&config);
        let (x, mels) = test_inputs(&config, 2);

        let y_hat = model.forward(&x, &mels)?;
        assert_eq!(
            y_hat.dims(),
            &[2, config.seq_len, 3 * crate::loss::N_MIXTURES]
        );
        Ok(())
    }

    #[test]
    fn test_replica_matches_original() -> Result<()> {
        let config = TrainConfig::test();
        let (_varmap, model) = build(&config);
        let (x, mels) = test_inputs(&config, 2);

        let replica = model.replicate_to(&Device::Cpu)?;
        let a = model.forward(&x, &mels)?.flatten_all()?.to_vec1::<f32>()?;
        let b = replica
            .forward(&x, &mels)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for (lhs, rhs) in a.iter().zip(b.iter()) {
            assert!((lhs - rhs).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_stretch_repeats_frames() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[1.0f32, 2.0]]], &device)?;
        let stretched = stretch(&x, 3)?;
        assert_eq!(
            stretched.to_vec3::<f32>()?,
            vec![vec![vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]]]
        );
        Ok(())
    }

    #[test]
    fn test_gru_cell_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cell = GruCell::new(6, 4, vb)?;

        let x = Tensor::zeros((3, 6), DType::F32, &device)?;
        let h = Tensor::zeros((3, 4), DType::F32, &device)?;
        assert_eq!(cell.step(&x, &h)?.dims(), &[3, 4]);

        let xs = Tensor::zeros((3, 5, 6), DType::F32, &device)?;
        assert_eq!(cell.seq(&xs)?.dims(), &[3, 5, 4]);
        Ok(())
    }
}
