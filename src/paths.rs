//! Filesystem layout of a training run.
//!
//! Maps logical artifact keys to locations under a single run directory. The
//! checkpoint layer treats these as opaque handles with existence and
//! parent-creation operations; all read/write logic lives elsewhere.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, TrainResult};

/// Resolved paths for one training run.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Run root directory
    pub root: PathBuf,
    /// Named-checkpoint directory
    pub checkpoints: PathBuf,
    /// Latest model weights (always overwritten, used for resumption)
    pub latest_weights: PathBuf,
    /// Latest optimizer state
    pub latest_optim: PathBuf,
    /// Generated audio output directory
    pub output: PathBuf,
    /// Per-epoch training log
    pub log_file: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            checkpoints: root.join("checkpoints"),
            latest_weights: root.join("latest_weights.safetensors"),
            latest_optim: root.join("latest_optim.json"),
            output: root.join("output"),
            log_file: root.join("log.txt"),
            root,
        }
    }

    /// Weights artifact for a named checkpoint.
    pub fn named_weights(&self, name: &str) -> PathBuf {
        self.checkpoints.join(format!("{name}_weights.safetensors"))
    }

    /// Optimizer-state artifact for a named checkpoint.
    pub fn named_optim(&self, name: &str) -> PathBuf {
        self.checkpoints.join(format!("{name}_optim.json"))
    }

    /// Create the containing directory of an artifact path.
    pub fn ensure_parent(path: &Path) -> TrainResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        Ok(())
    }

    /// Append one line to the run log, creating it on first use.
    pub fn append_log(&self, msg: &str) -> TrainResult<()> {
        Self::ensure_parent(&self.log_file)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_path(&self.log_file)?;
        writeln!(file, "{msg}").with_path(&self.log_file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = Paths::new("/tmp/run");
        assert_eq!(
            paths.latest_weights,
            PathBuf::from("/tmp/run/latest_weights.safetensors")
        );
        assert_eq!(
            paths.named_weights("wave_step3K"),
            PathBuf::from("/tmp/run/checkpoints/wave_step3K_weights.safetensors")
        );
        assert_eq!(
            paths.named_optim("wave_step3K"),
            PathBuf::from("/tmp/run/checkpoints/wave_step3K_optim.json")
        );
    }

    #[test]
    fn test_append_log_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("run"));
        paths.append_log("epoch 1 done").unwrap();
        paths.append_log("epoch 2 done").unwrap();

        let contents = std::fs::read_to_string(&paths.log_file).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
