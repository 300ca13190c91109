//! # WaveRNN Training Library
//!
//! Resumable, step-indexed training for a WaveRNN-style neural vocoder on
//! the candle tensor stack.
//!
//! ## Architecture Overview
//!
//! - **Checkpoints**: a (weights, optimizer state) artifact pair per
//!   identity, either the always-overwritten `latest` or an additive named
//!   snapshot, with a both-or-neither invariant so a killed run resumes
//!   without silent corruption
//! - **Objectives**: categorical cross-entropy (Raw) or discretized
//!   mixture-of-logistics (Mol), selected once from the model mode
//! - **Devices**: single-device forward or manual batch sharding across
//!   parallel accelerators behind one strategy interface
//! - **Generation**: batched fold/cross-fade sampling of held-out items at
//!   every checkpoint
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use wavernn_train::{
//!     checkpoint::CheckpointId, config::TrainConfig, device::ForwardPlan, paths::Paths,
//!     train::Trainer,
//! };
//!
//! # fn main() -> wavernn_train::error::TrainResult<()> {
//! let config = TrainConfig::ljspeech();
//! let plan = ForwardPlan::new(Device::Cpu, 1, config.batch_size)?;
//! let mut trainer = Trainer::new(config, Paths::new("checkpoints/wavernn"), plan)?;
//! trainer.restore(&CheckpointId::Latest, true)?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod generate;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod paths;
pub mod train;
