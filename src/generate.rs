//! Checkpoint-time audio generation.
//!
//! Generation is sequential per sample. For long utterances the upsampled
//! conditioning is folded into overlapping segments that generate as one
//! batch and are cross-faded back together, trading a short fade window for
//! a large wall-clock win.

use std::path::Path;

use candle_core::{DType, Result, Tensor};
use candle_nn::ops::softmax;
use rand::distributions::WeightedIndex;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::config::{ModelMode, TrainConfig};
use crate::data::{label_2_float, VocoderDataset};
use crate::error::{IoResultExt, TrainError, TrainResult};
use crate::logging::log_generation;
use crate::model::WaveRnn;
use crate::paths::Paths;

impl WaveRnn {
    /// Generate one utterance from unpadded mel frames `[1, M, F]`.
    ///
    /// With `batched` the conditioning is folded into segments of
    /// `target + 2*overlap` samples that generate in parallel. The seed makes
    /// sampling reproducible for a given checkpoint.
    pub fn generate(
        &self,
        mels: &Tensor,
        batched: bool,
        target: usize,
        overlap: usize,
        seed: u64,
    ) -> TrainResult<Vec<f32>> {
        let (_, n_mels, frames) = mels.dims3()?;
        let device = self.device().clone();

        // Keep the utterance edges: the conditioner consumes `pad` frames of
        // context on each side.
        let edge = Tensor::zeros((1, n_mels, self.pad), DType::F32, &device)?;
        let padded = Tensor::cat(&[&edge, mels, &edge], 2)?;
        let (mels_up, aux) = self.upsample.forward(&padded)?;

        let wave_len = frames * self.hop_length;
        let frame_len = target + 2 * overlap;
        let folded = batched && mels_up.dim(1)? > frame_len;
        let (mels_up, aux) = if folded {
            (
                fold_with_overlap(&mels_up, target, overlap)?,
                fold_with_overlap(&aux, target, overlap)?,
            )
        } else {
            (mels_up, aux)
        };

        let (batch, steps, _) = mels_up.dims3()?;
        let rnn_dims = self.rnn1.hidden_dim();
        let mut h1 = Tensor::zeros((batch, rnn_dims), DType::F32, &device)?;
        let mut h2 = Tensor::zeros((batch, rnn_dims), DType::F32, &device)?;
        let mut x = Tensor::zeros((batch, 1), DType::F32, &device)?;

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let a = self.aux_dims;
        let mut rows: Vec<Vec<f32>> = vec![Vec::with_capacity(steps); batch];

        for t in 0..steps {
            let m_t = mels_up.narrow(1, t, 1)?.squeeze(1)?;
            let aux_t = aux.narrow(1, t, 1)?.squeeze(1)?;
            let a1 = aux_t.narrow(1, 0, a)?;
            let a2 = aux_t.narrow(1, a, a)?;
            let a3 = aux_t.narrow(1, 2 * a, a)?;
            let a4 = aux_t.narrow(1, 3 * a, a)?;

            let inp = Tensor::cat(&[&x, &m_t, &a1], 1)?;
            let inp = self.i.forward(&inp)?;

            h1 = self.rnn1.step(&inp, &h1)?;
            let xr = (&inp + &h1)?;

            let rnn2_in = Tensor::cat(&[&xr, &a2], 1)?;
            h2 = self.rnn2.step(&rnn2_in, &h2)?;
            let xr = (&xr + &h2)?;

            let xf = Tensor::cat(&[&xr, &a3], 1)?;
            let xf = self.fc1.forward(&xf)?.relu()?;
            let xf = Tensor::cat(&[&xf, &a4], 1)?;
            let xf = self.fc2.forward(&xf)?.relu()?;
            let params = self.fc3.forward(&xf)?;

            let samples = match self.mode {
                ModelMode::Raw => sample_categorical_batch(&params, self.bits, &mut rng)?,
                ModelMode::Mol => sample_logistic_mixture_batch(&params, &mut rng)?,
            };
            for (row, &s) in rows.iter_mut().zip(samples.iter()) {
                row.push(s);
            }
            x = Tensor::from_vec(samples, (batch, 1), &device)?;
        }

        let mut out = if folded {
            xfade_and_unfold(&rows, target, overlap)
        } else {
            rows.into_iter().next().unwrap_or_default()
        };
        out.truncate(wave_len);
        Ok(out)
    }
}

/// Sample one quantization label per row of `[B, C]` logits and decode it.
fn sample_categorical_batch(
    logits: &Tensor,
    bits: usize,
    rng: &mut impl Rng,
) -> Result<Vec<f32>> {
    let probs = softmax(logits, candle_core::D::Minus1)?.to_vec2::<f32>()?;
    Ok(probs
        .iter()
        .map(|row| {
            let label = sample_index(row, rng);
            label_2_float(label as f32, bits)
        })
        .collect())
}

/// Sample one value per row of `[B, 3*M]` mixture parameters.
fn sample_logistic_mixture_batch(params: &Tensor, rng: &mut impl Rng) -> Result<Vec<f32>> {
    let rows = params.to_vec2::<f32>()?;
    let m = rows[0].len() / 3;

    Ok(rows
        .iter()
        .map(|row| {
            let logits = &row[..m];
            let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let weights: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
            let k = sample_index(&weights, rng);

            let mean = row[m + k];
            let log_scale = row[2 * m + k].max(crate::loss::LOG_SCALE_MIN as f32);
            let u: f32 = rng.gen_range(1e-5..1.0 - 1e-5);
            let sample = mean + log_scale.exp() * (u.ln() - (1.0 - u).ln());
            sample.clamp(-1.0, 1.0)
        })
        .collect())
}

fn sample_index(weights: &[f32], rng: &mut impl Rng) -> usize {
    match WeightedIndex::new(weights) {
        Ok(dist) => rng.sample(dist),
        // Degenerate weights: fall back to the mode of the distribution.
        Err(_) => weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0),
    }
}

/// Fold `[1, T, C]` into overlapping rows `[N, target + 2*overlap, C]`,
/// zero-padding the tail so every row is full length.
fn fold_with_overlap(x: &Tensor, target: usize, overlap: usize) -> Result<Tensor> {
    let (_, total, c) = x.dims3()?;
    let frame = target + 2 * overlap;
    let stride = target + overlap;

    let n = if total <= frame {
        1
    } else {
        1 + (total - frame).div_ceil(stride)
    };
    let needed = (n - 1) * stride + frame;

    let x = if needed > total {
        let pad = Tensor::zeros((1, needed - total, c), x.dtype(), x.device())?;
        Tensor::cat(&[x, &pad], 1)?
    } else {
        x.clone()
    };

    let rows = (0..n)
        .map(|i| x.narrow(1, i * stride, frame)?.squeeze(0))
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&rows, 0)
}

/// Cross-fade overlapping generated rows back into one waveform.
///
/// Head and tail fade weights are complementary, so overlapped samples sum
/// with unit gain; the first head and last tail are left unfaded.
fn xfade_and_unfold(rows: &[Vec<f32>], target: usize, overlap: usize) -> Vec<f32> {
    let n = rows.len();
    if n == 0 {
        return Vec::new();
    }
    let frame = target + 2 * overlap;
    let stride = target + overlap;
    let total = (n - 1) * stride + frame;
    let mut out = vec![0.0f32; total];

    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            let w = if i > 0 && j < overlap {
                (j as f32 + 0.5) / overlap as f32
            } else if i + 1 < n && j >= stride {
                1.0 - ((j - stride) as f32 + 0.5) / overlap as f32
            } else {
                1.0
            };
            out[i * stride + j] += w * v;
        }
    }
    out
}

/// Write mono 16-bit PCM audio.
pub fn save_wav(path: &Path, samples: &[f32], sample_rate: usize) -> TrainResult<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: sample_rate as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let io_err = |e: hound::Error| TrainError::Io {
        message: e.to_string(),
        path: path.display().to_string(),
    };

    let mut writer = hound::WavWriter::create(path, spec).map_err(io_err)?;
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(v).map_err(io_err)?;
    }
    writer.finalize().map_err(io_err)?;
    Ok(())
}

/// Generate audio for the first held-out items and write target/generated
/// WAV pairs under the run's output directory.
pub fn gen_testset(
    model: &WaveRnn,
    test_set: &dyn VocoderDataset,
    config: &TrainConfig,
    paths: &Paths,
    step: usize,
) -> TrainResult<()> {
    std::fs::create_dir_all(&paths.output).with_path(&paths.output)?;
    let k = step / 1000;
    let n = config.gen_at_checkpoint.min(test_set.len());
    let batch_str = if config.gen_batched {
        "batched"
    } else {
        "unbatched"
    };

    for i in 0..n {
        let item = test_set.get_item(i);
        info!(step, sample = i, frames = item.n_frames, "generating");

        save_wav(
            &paths.output.join(format!("{k}k_steps_{i}_target.wav")),
            &item.audio,
            config.sample_rate,
        )?;

        let mels = Tensor::from_vec(
            item.mel.clone(),
            (1, item.n_mels, item.n_frames),
            model.device(),
        )?;
        let samples = model.generate(
            &mels,
            config.gen_batched,
            config.gen_target,
            config.gen_overlap,
            step as u64,
        )?;
        save_wav(
            &paths.output.join(format!("{k}k_steps_{i}_{batch_str}.wav")),
            &samples,
            config.sample_rate,
        )?;
    }

    log_generation(step, n);
    Ok(())
}
