//! Training configuration for the WaveRNN vocoder.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, TrainError, TrainResult};

fn default_log_interval() -> usize {
    50
}

fn default_test_samples() -> usize {
    50
}

fn default_gen_batched() -> bool {
    true
}

/// Output-distribution mode of the vocoder.
///
/// `Raw` emits a categorical distribution over `2^bits` quantization levels;
/// `Mol` emits discretized mixture-of-logistics parameters. The two modes are
/// mutually exclusive and fix both the loss function and the tensor shape
/// convention for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    Raw,
    Mol,
}

/// Model + training hyperparameter configuration.
///
/// Immutable for the duration of a run; the training loop only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    // Audio
    pub sample_rate: usize,
    pub hop_length: usize,
    pub num_mels: usize,
    /// Bit depth of the quantized signal (Raw mode emits 2^bits classes)
    pub bits: usize,
    pub mode: ModelMode,

    // Model architecture
    /// Per-stage upsampling factors; their product must equal hop_length
    pub upsample_factors: Vec<usize>,
    pub rnn_dims: usize,
    pub fc_dims: usize,
    pub compute_dims: usize,
    pub res_out_dims: usize,
    pub res_blocks: usize,
    /// Mel frames of context the conditioner consumes on each side
    pub pad: usize,

    // Training hyperparams
    pub lr: f64,
    pub batch_size: usize,
    /// Samples per training window; must be a multiple of hop_length
    pub seq_len: usize,
    pub total_steps: usize,
    pub checkpoint_every: usize,
    /// Gradient-norm clip threshold (None = no clipping)
    #[serde(default)]
    pub grad_clip: Option<f64>,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Held-out items used for checkpoint-time generation
    #[serde(default = "default_test_samples")]
    pub test_samples: usize,

    // Checkpoint-time generation
    pub gen_at_checkpoint: usize,
    #[serde(default = "default_gen_batched")]
    pub gen_batched: bool,
    pub gen_target: usize,
    pub gen_overlap: usize,
}

impl TrainConfig {
    /// 9-bit Raw-mode configuration for 22.05 kHz speech (LJSpeech-style).
    pub fn ljspeech() -> Self {
        Self {
            sample_rate: 22050,
            hop_length: 275,
            num_mels: 80,
            bits: 9,
            mode: ModelMode::Raw,

            upsample_factors: vec![5, 5, 11],
            rnn_dims: 512,
            fc_dims: 512,
            compute_dims: 128,
            res_out_dims: 128,
            res_blocks: 10,
            pad: 2,

            lr: 1e-4,
            batch_size: 32,
            seq_len: 275 * 5,
            total_steps: 500_000,
            checkpoint_every: 25_000,
            grad_clip: Some(4.0),
            log_interval: 50,
            test_samples: 50,

            gen_at_checkpoint: 5,
            gen_batched: true,
            gen_target: 11_000,
            gen_overlap: 550,
        }
    }

    /// Mixture-of-logistics configuration for 16 kHz audio.
    pub fn mol() -> Self {
        Self {
            sample_rate: 16000,
            hop_length: 200,
            num_mels: 80,
            bits: 16,
            mode: ModelMode::Mol,

            upsample_factors: vec![4, 5, 10],
            rnn_dims: 512,
            fc_dims: 512,
            compute_dims: 128,
            res_out_dims: 128,
            res_blocks: 10,
            pad: 2,

            lr: 1e-4,
            batch_size: 32,
            seq_len: 200 * 5,
            total_steps: 1_000_000,
            checkpoint_every: 25_000,
            grad_clip: Some(4.0),
            log_interval: 50,
            test_samples: 50,

            gen_at_checkpoint: 5,
            gen_batched: true,
            gen_target: 11_000,
            gen_overlap: 550,
        }
    }

    /// Tiny CPU configuration for tests and loop validation.
    pub fn test() -> Self {
        Self {
            sample_rate: 8000,
            hop_length: 4,
            num_mels: 8,
            bits: 4,
            mode: ModelMode::Raw,

            upsample_factors: vec![2, 2],
            rnn_dims: 16,
            fc_dims: 16,
            compute_dims: 8,
            res_out_dims: 8,
            res_blocks: 1,
            pad: 1,

            lr: 1e-3,
            batch_size: 2,
            seq_len: 8,
            total_steps: 10,
            checkpoint_every: 5,
            grad_clip: Some(4.0),
            log_interval: 1,
            test_samples: 2,

            gen_at_checkpoint: 1,
            gen_batched: false,
            gen_target: 8,
            gen_overlap: 2,
        }
    }

    /// Load a configuration from a JSON hyperparameter file.
    pub fn from_file(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            TrainError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Number of output classes the model head emits in this configuration.
    pub fn n_classes(&self) -> usize {
        match self.mode {
            ModelMode::Raw => 1 << self.bits,
            ModelMode::Mol => 3 * crate::loss::N_MIXTURES,
        }
    }

    /// Mel frames per training window, including conditioner context.
    pub fn mel_window(&self) -> usize {
        self.seq_len / self.hop_length + 2 * self.pad
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let upsample_product: usize = self.upsample_factors.iter().product();
        if upsample_product != self.hop_length {
            errors.push(format!(
                "upsample_factors product ({}) must equal hop_length ({})",
                upsample_product, self.hop_length
            ));
        }

        if self.seq_len == 0 || !self.seq_len.is_multiple_of(self.hop_length) {
            errors.push(format!(
                "seq_len ({}) must be a non-zero multiple of hop_length ({})",
                self.seq_len, self.hop_length
            ));
        }

        if self.bits == 0 || self.bits > 16 {
            errors.push(format!("bits ({}) must be in 1..=16", self.bits));
        }

        if !self.res_out_dims.is_multiple_of(4) {
            errors.push(format!(
                "res_out_dims ({}) must be divisible by 4 (aux feature split)",
                self.res_out_dims
            ));
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if self.total_steps == 0 {
            errors.push("total_steps must be greater than 0".to_string());
        }

        if self.checkpoint_every == 0 {
            errors.push("checkpoint_every must be greater than 0".to_string());
        }

        if self.lr <= 0.0 {
            errors.push(format!("learning rate ({}) must be positive", self.lr));
        }

        if self.num_mels == 0 {
            errors.push("num_mels must be greater than 0".to_string());
        }

        if let Some(clip) = self.grad_clip {
            if clip <= 0.0 {
                errors.push(format!("grad_clip ({}) must be positive", clip));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(TrainConfig::ljspeech().validate().is_ok());
        assert!(TrainConfig::mol().validate().is_ok());
        assert!(TrainConfig::test().validate().is_ok());
    }

    #[test]
    fn test_validate_catches_errors() {
        let mut config = TrainConfig::test();
        config.upsample_factors = vec![3];
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("upsample_factors")));

        let mut config = TrainConfig::test();
        config.seq_len = 7;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("seq_len")));

        let mut config = TrainConfig::test();
        config.res_out_dims = 6;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("res_out_dims")));
    }

    #[test]
    fn test_n_classes_per_mode() {
        let mut config = TrainConfig::test();
        config.mode = ModelMode::Raw;
        config.bits = 9;
        assert_eq!(config.n_classes(), 512);

        config.mode = ModelMode::Mol;
        assert_eq!(config.n_classes(), 30);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = TrainConfig::ljspeech();
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hop_length, config.hop_length);
        assert_eq!(back.mode, config.mode);
        assert_eq!(back.grad_clip, config.grad_clip);
    }
}
