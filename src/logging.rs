//! Structured logging for training runs with tracing.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured JSON logging for production monitoring.
///
/// Reads the log level from RUST_LOG (defaults to "info").
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,wavernn_train=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Initialize human-readable console logging.
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,wavernn_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Log one training-progress line.
#[allow(clippy::too_many_arguments)]
pub fn log_step(
    step: usize,
    total_steps: usize,
    epoch: usize,
    epochs: usize,
    batch: usize,
    batches: usize,
    avg_loss: f64,
    steps_per_sec: f64,
) {
    info!(
        step,
        total_steps,
        epoch,
        epochs,
        batch,
        batches,
        avg_loss = format!("{avg_loss:.4}").as_str(),
        steps_per_sec = format!("{steps_per_sec:.1}").as_str(),
        "training"
    );
}

/// Log a checkpoint-save event.
pub fn log_checkpoint_save(step: usize, checkpoint: &str) {
    info!(step, checkpoint, event = "checkpoint_saved", "checkpoint saved");
}

/// Log a checkpoint-time generation pass.
pub fn log_generation(step: usize, samples: usize) {
    info!(
        step,
        samples,
        event = "generation",
        "generated test samples"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_does_not_panic() {
        // No subscriber installed; events are dropped but must not panic.
        log_step(100, 1000, 1, 2, 10, 500, 3.21, 1.5);
        log_checkpoint_save(100, "latest");
        log_generation(100, 5);
    }
}
