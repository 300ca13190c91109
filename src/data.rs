//! Vocoder datasets and the training batch loader.
//!
//! Items are (mel spectrogram, audio) pairs; the loader cuts seeded random
//! windows out of each item and collates them into `(x, y, mels)` batch
//! triples. Mel windows carry `pad` extra frames of context on each side for
//! the conditioner's unpadded input convolution.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::{ModelMode, TrainConfig};
use crate::error::{TrainError, TrainResult};

/// Map a quantization label to [-1, 1].
pub fn label_2_float(label: f32, bits: usize) -> f32 {
    2.0 * label / ((1 << bits) - 1) as f32 - 1.0
}

/// Map a [-1, 1] sample to its quantization label.
pub fn float_2_label(x: f32, bits: usize) -> u32 {
    let max = ((1 << bits) - 1) as f32;
    (((x + 1.0) * max / 2.0).round()).clamp(0.0, max) as u32
}

/// One dataset item: a mel spectrogram and its aligned audio in [-1, 1].
pub struct VocoderItem {
    /// Row-major `[n_mels][n_frames]` mel values
    pub mel: Vec<f32>,
    pub n_mels: usize,
    pub n_frames: usize,
    pub audio: Vec<f32>,
}

/// A dataset of mel-conditioned audio clips.
pub trait VocoderDataset {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get_item(&self, idx: usize) -> &VocoderItem;
}

/// Deterministic synthetic clips for training-loop validation.
pub struct SyntheticVocoderDataset {
    items: Vec<VocoderItem>,
}

impl SyntheticVocoderDataset {
    pub fn new(n_items: usize, n_mels: usize, n_frames: usize, hop: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut items = Vec::with_capacity(n_items);

        for _ in 0..n_items {
            let mel: Vec<f32> = (0..n_mels * n_frames)
                .map(|_| rng.gen_range(-1.0f32..1.0))
                .collect();

            let n_samples = n_frames * hop;
            let freq = rng.gen_range(0.01f32..0.2);
            let phase = rng.gen_range(0.0f32..std::f32::consts::TAU);
            let audio: Vec<f32> = (0..n_samples)
                .map(|i| (0.5 * (freq * i as f32 + phase).sin()))
                .collect();

            items.push(VocoderItem {
                mel,
                n_mels,
                n_frames,
                audio,
            });
        }

        Self { items }
    }
}

impl VocoderDataset for SyntheticVocoderDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get_item(&self, idx: usize) -> &VocoderItem {
        &self.items[idx]
    }
}

/// Preprocessed dataset loaded from npy feature files.
///
/// Expects `<dir>/dataset.json` (a JSON array of item ids), mel frames under
/// `<dir>/mel/<id>.npy` (or `<dir>/gta/<id>.npy` for ground-truth-aligned
/// features) and quantized audio labels under `<dir>/quant/<id>.npy`.
pub struct NpyVocoderDataset {
    items: Vec<VocoderItem>,
}

impl NpyVocoderDataset {
    pub fn load(dir: &Path, ids: &[String], bits: usize, gta: bool) -> TrainResult<Self> {
        let mel_dir = dir.join(if gta { "gta" } else { "mel" });
        let quant_dir = dir.join("quant");
        let mut items = Vec::with_capacity(ids.len());

        for id in ids {
            let mel_path = mel_dir.join(format!("{id}.npy"));
            let mel_t = Tensor::read_npy(&mel_path).map_err(|e| {
                TrainError::DataLoading(format!("failed to read {}: {}", mel_path.display(), e))
            })?;
            let (n_mels, n_frames) = mel_t
                .dims2()
                .map_err(|_| TrainError::DataLoading(format!("{id}: mel must be 2-D")))?;
            let mel = mel_t
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all()?.to_vec1::<f32>())
                .map_err(|e| TrainError::DataLoading(format!("{id}: {e}")))?;

            let quant_path = quant_dir.join(format!("{id}.npy"));
            let quant_t = Tensor::read_npy(&quant_path).map_err(|e| {
                TrainError::DataLoading(format!("failed to read {}: {}", quant_path.display(), e))
            })?;
            let labels = quant_t
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all()?.to_vec1::<f32>())
                .map_err(|e| TrainError::DataLoading(format!("{id}: {e}")))?;
            let audio: Vec<f32> = labels.iter().map(|&l| label_2_float(l, bits)).collect();

            items.push(VocoderItem {
                mel,
                n_mels,
                n_frames,
                audio,
            });
        }

        Ok(Self { items })
    }
}

impl VocoderDataset for NpyVocoderDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get_item(&self, idx: usize) -> &VocoderItem {
        &self.items[idx]
    }
}

/// Load the preprocessed dataset and split off the held-out generation items.
pub fn get_vocoder_datasets(
    data_dir: &Path,
    config: &TrainConfig,
    gta: bool,
) -> TrainResult<(NpyVocoderDataset, NpyVocoderDataset)> {
    let index_path = data_dir.join("dataset.json");
    let raw = std::fs::read_to_string(&index_path).map_err(|e| {
        TrainError::DataLoading(format!("failed to read {}: {}", index_path.display(), e))
    })?;
    let ids: Vec<String> = serde_json::from_str(&raw).map_err(|e| {
        TrainError::DataLoading(format!("failed to parse {}: {}", index_path.display(), e))
    })?;

    if ids.len() <= config.test_samples {
        return Err(TrainError::DataLoading(format!(
            "dataset has {} items but {} test samples are held out",
            ids.len(),
            config.test_samples
        )));
    }

    // The quantization bit depth of the stored labels: Mol training keeps
    // 16-bit audio regardless of the Raw-mode bit setting.
    let bits = match config.mode {
        ModelMode::Raw => config.bits,
        ModelMode::Mol => 16,
    };

    let split = ids.len() - config.test_samples;
    let train = NpyVocoderDataset::load(data_dir, &ids[..split], bits, gta)?;
    let test = NpyVocoderDataset::load(data_dir, &ids[split..], bits, false)?;
    Ok((train, test))
}

/// Batched window iterator over a vocoder dataset.
///
/// Yields only complete batches so every batch satisfies the device plan's
/// shard divisibility.
pub struct VocoderLoader<'a> {
    dataset: &'a dyn VocoderDataset,
    batch_size: usize,
    seq_len: usize,
    hop: usize,
    pad: usize,
    mode: ModelMode,
    bits: usize,
    indices: Vec<usize>,
    pos: usize,
    rng: rand::rngs::StdRng,
    device: Device,
}

impl<'a> VocoderLoader<'a> {
    pub fn new(
        dataset: &'a dyn VocoderDataset,
        config: &TrainConfig,
        shuffle: bool,
        seed: u64,
        device: &Device,
    ) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        if shuffle {
            indices.shuffle(&mut rng);
        }
        Self {
            dataset,
            batch_size: config.batch_size,
            seq_len: config.seq_len,
            hop: config.hop_length,
            pad: config.pad,
            mode: config.mode,
            bits: config.bits,
            indices,
            pos: 0,
            rng,
            device: device.clone(),
        }
    }

    /// Complete batches this loader will yield.
    pub fn n_batches(&self) -> usize {
        self.indices.len() / self.batch_size
    }

    fn collate(&mut self, batch_indices: &[usize]) -> TrainResult<(Tensor, Tensor, Tensor)> {
        let window = self.seq_len / self.hop + 2 * self.pad;
        let batch = batch_indices.len();

        let mut mels = Vec::with_capacity(batch * window);
        let mut xs = Vec::with_capacity(batch * self.seq_len);
        let mut raw_targets = Vec::with_capacity(batch * self.seq_len);
        let mut mol_targets = Vec::with_capacity(batch * self.seq_len);
        let mut n_mels = 0;

        for &idx in batch_indices {
            let item = self.dataset.get_item(idx);
            n_mels = item.n_mels;

            if item.n_frames < window {
                return Err(TrainError::DataLoading(format!(
                    "item has {} mel frames but windows need {}",
                    item.n_frames, window
                )));
            }
            let max_mel_off = item.n_frames - window;
            let max_audio_off = (item.audio.len().saturating_sub(self.seq_len + 1) / self.hop)
                .saturating_sub(self.pad);
            let max_off = max_mel_off.min(max_audio_off);
            let off = self.rng.gen_range(0..=max_off);

            for c in 0..item.n_mels {
                let row = c * item.n_frames + off;
                mels.extend_from_slice(&item.mel[row..row + window]);
            }

            let sample_off = (off + self.pad) * self.hop;
            for i in 0..self.seq_len {
                let prev = item.audio[sample_off + i];
                let next = item.audio[sample_off + i + 1];
                match self.mode {
                    ModelMode::Raw => {
                        // Quantize the input so the model sees what it will
                        // be fed back during generation.
                        xs.push(label_2_float(float_2_label(prev, self.bits) as f32, self.bits));
                        raw_targets.push(float_2_label(next, self.bits));
                    }
                    ModelMode::Mol => {
                        xs.push(prev);
                        mol_targets.push(next);
                    }
                }
            }
        }

        let mels = Tensor::from_vec(mels, (batch, n_mels, window), &self.device)?;
        let x = Tensor::from_vec(xs, (batch, self.seq_len), &self.device)?;
        let y = match self.mode {
            ModelMode::Raw => Tensor::from_vec(raw_targets, (batch, self.seq_len), &self.device)?,
            ModelMode::Mol => Tensor::from_vec(mol_targets, (batch, self.seq_len), &self.device)?,
        };
        Ok((x, y, mels))
    }
}

impl Iterator for VocoderLoader<'_> {
    type Item = TrainResult<(Tensor, Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + self.batch_size > self.indices.len() {
            return None;
        }
        let batch_indices: Vec<usize> =
            self.indices[self.pos..self.pos + self.batch_size].to_vec();
        self.pos += self.batch_size;
        Some(self.collate(&batch_indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_float_roundtrip() {
        for bits in [4usize, 9, 16] {
            for label in [0u32, 1, (1 << bits) / 2, (1 << bits) - 1] {
                let x = label_2_float(label as f32, bits);
                assert!((-1.0..=1.0).contains(&x));
                assert_eq!(float_2_label(x, bits), label);
            }
        }
    }

    #[test]
    fn test_synthetic_dataset_shapes() {
        let ds = SyntheticVocoderDataset::new(5, 8, 10, 4, 42);
        assert_eq!(ds.len(), 5);
        let item = ds.get_item(0);
        assert_eq!(item.mel.len(), 8 * 10);
        assert_eq!(item.audio.len(), 10 * 4);
        assert!(item.audio.iter().all(|a| a.abs() <= 1.0));
    }

    #[test]
    fn test_loader_shapes_raw() -> TrainResult<()> {
        let config = TrainConfig::test();
        let ds = SyntheticVocoderDataset::new(
            6,
            config.num_mels,
            config.mel_window() + 2,
            config.hop_length,
            42,
        );
        let device = Device::Cpu;
        let mut loader = VocoderLoader::new(&ds, &config, true, 42, &device);
        assert_eq!(loader.n_batches(), 3);

        let (x, y, mels) = loader.next().unwrap()?;
        assert_eq!(x.dims(), &[2, config.seq_len]);
        assert_eq!(x.dtype(), DType::F32);
        assert_eq!(y.dims(), &[2, config.seq_len]);
        assert_eq!(y.dtype(), DType::U32);
        assert_eq!(mels.dims(), &[2, config.num_mels, config.mel_window()]);
        Ok(())
    }

    #[test]
    fn test_loader_targets_mol() -> TrainResult<()> {
        let mut config = TrainConfig::test();
        config.mode = ModelMode::Mol;
        let ds = SyntheticVocoderDataset::new(
            4,
            config.num_mels,
            config.mel_window() + 2,
            config.hop_length,
            7,
        );
        let device = Device::Cpu;
        let mut loader = VocoderLoader::new(&ds, &config, false, 7, &device);

        let (_, y, _) = loader.next().unwrap()?;
        assert_eq!(y.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_loader_drops_partial_batches() {
        let config = TrainConfig::test();
        let ds = SyntheticVocoderDataset::new(
            5,
            config.num_mels,
            config.mel_window() + 2,
            config.hop_length,
            1,
        );
        let device = Device::Cpu;
        let loader = VocoderLoader::new(&ds, &config, false, 1, &device);
        assert_eq!(loader.count(), 2); // 5 items, batch 2 -> 2 complete batches
    }
}
