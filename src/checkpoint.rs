//! Crash-safe checkpoint save/restore.
//!
//! A checkpoint is a pair of artifacts (model weights, optimizer state)
//! under one identity: the `latest` pair that resumption always targets, or
//! an additive named snapshot. The invariant is that both artifacts exist or
//! neither does; observing exactly one is a corruption signal that is
//! surfaced, never repaired.
//!
//! Each artifact is written to a temporary path and renamed into place,
//! weights first, so a crash never leaves a torn file. The step counter is
//! embedded in the weights artifact and mirrored in the optimizer snapshot;
//! `restore` cross-checks the two, which catches a crash that landed between
//! the renames of an overwritten pair.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{safetensors, Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{checkpoint_error, IoResultExt, TrainError, TrainResult};
use crate::optim::{Adam, AdamState};
use crate::paths::Paths;

/// Key under which the step counter is stored in the weights file.
const STEP_KEY: &str = "global_step";

/// Checkpoint identity: the always-overwritten `latest` pair used for
/// resumption, or a named snapshot taken at a step boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointId {
    Latest,
    Named(String),
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointId::Latest => write!(f, "latest"),
            CheckpointId::Named(name) => write!(f, "{name}"),
        }
    }
}

/// Optimizer-state artifact contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OptimizerSnapshot {
    step: usize,
    adam: AdamState,
}

fn artifact_paths(paths: &Paths, id: &CheckpointId) -> (PathBuf, PathBuf) {
    match id {
        CheckpointId::Latest => (paths.latest_weights.clone(), paths.latest_optim.clone()),
        CheckpointId::Named(name) => (paths.named_weights(name), paths.named_optim(name)),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(".tmp");
    PathBuf::from(p)
}

fn write_weights(varmap: &VarMap, step: usize, path: &Path) -> TrainResult<()> {
    let mut tensors: HashMap<String, Tensor> = {
        let data = varmap.data().lock().unwrap();
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    };
    tensors.insert(
        STEP_KEY.to_string(),
        Tensor::from_vec(vec![step as u32], 1, &Device::Cpu)?,
    );

    let tmp = tmp_path(path);
    safetensors::save(&tensors, &tmp)?;
    std::fs::rename(&tmp, path).with_path(path)?;
    Ok(())
}

fn read_weights(varmap: &VarMap, path: &Path) -> TrainResult<usize> {
    let tensors = safetensors::load(path, &Device::Cpu)?;

    let step_t = tensors
        .get(STEP_KEY)
        .ok_or_else(|| checkpoint_error("weights file carries no step counter", path))?;
    let step = step_t.to_vec1::<u32>()?[0] as usize;

    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| checkpoint_error(format!("missing tensor '{name}'"), path))?;
        var.set(&tensor.to_device(var.device())?)?;
    }
    Ok(step)
}

fn write_optim(optim: &Adam, step: usize, path: &Path) -> TrainResult<()> {
    let snapshot = OptimizerSnapshot {
        step,
        adam: optim.export_state()?,
    };
    let json = serde_json::to_string(&snapshot)
        .map_err(|e| checkpoint_error(format!("optimizer state serialize: {e}"), path))?;

    let tmp = tmp_path(path);
    std::fs::write(&tmp, json).with_path(&tmp)?;
    std::fs::rename(&tmp, path).with_path(path)?;
    Ok(())
}

fn read_optim(optim: &mut Adam, path: &Path) -> TrainResult<usize> {
    let json = std::fs::read_to_string(path).with_path(path)?;
    let snapshot: OptimizerSnapshot = serde_json::from_str(&json)
        .map_err(|e| checkpoint_error(format!("optimizer state parse: {e}"), path))?;
    optim.import_state(&snapshot.adam)?;
    Ok(snapshot.step)
}

/// Persist the (weights, optimizer state) pair for `id`.
///
/// Counts how many of the two artifacts already exist: none means first-time
/// creation (parent directories are made), exactly one means the pair was
/// left inconsistent by an earlier crash. The save proceeds and repairs it
/// by construction, since both files are rewritten.
pub fn save(
    paths: &Paths,
    id: &CheckpointId,
    varmap: &VarMap,
    step: usize,
    optim: &Adam,
    silent: bool,
) -> TrainResult<()> {
    let (weights, optim_path) = artifact_paths(paths, id);
    let num_exist = [&weights, &optim_path]
        .iter()
        .filter(|p| p.exists())
        .count();

    match num_exist {
        0 => {
            if !silent {
                info!(checkpoint = %id, "creating checkpoint");
            }
            Paths::ensure_parent(&weights)?;
            Paths::ensure_parent(&optim_path)?;
        }
        1 => {
            warn!(checkpoint = %id, "checkpoint pair was inconsistent; rewriting both artifacts");
        }
        _ => {
            if !silent {
                info!(checkpoint = %id, "saving to existing checkpoint");
            }
        }
    }

    write_weights(varmap, step, &weights)?;
    write_optim(optim, step, &optim_path)?;

    if !silent {
        info!(checkpoint = %id, step, weights = %weights.display(), "checkpoint saved");
    }
    Ok(())
}

/// Restore the pair for `id`, returning the persisted step count.
///
/// The model variables must already sit on their target device; optimizer
/// state is materialized onto the same devices as the parameters it tracks.
/// With `create_if_missing`, a wholly absent checkpoint is bootstrapped at
/// step zero instead of failing. A half-present pair always fails.
pub fn restore(
    paths: &Paths,
    id: &CheckpointId,
    varmap: &VarMap,
    optim: &mut Adam,
    create_if_missing: bool,
) -> TrainResult<usize> {
    let (weights, optim_path) = artifact_paths(paths, id);
    let num_exist = [&weights, &optim_path]
        .iter()
        .filter(|p| p.exists())
        .count();

    match num_exist {
        2 => {
            info!(checkpoint = %id, "restoring from checkpoint");
            let step = read_weights(varmap, &weights)?;
            let optim_step = read_optim(optim, &optim_path)?;
            if optim_step != step {
                return Err(TrainError::CorruptedCheckpoint {
                    identity: id.to_string(),
                    message: format!(
                        "weights are at step {step} but optimizer state is at step {optim_step}"
                    ),
                });
            }
            info!(checkpoint = %id, step, "checkpoint restored");
            Ok(step)
        }
        0 if create_if_missing => {
            save(paths, id, varmap, 0, optim, false)?;
            Ok(0)
        }
        0 => Err(TrainError::MissingCheckpoint {
            identity: id.to_string(),
        }),
        _ => Err(TrainError::CorruptedCheckpoint {
            identity: id.to_string(),
            message: "expected both or no artifacts to exist, found exactly one".to_string(),
        }),
    }
}
