use serde::{Deserialize, Serialize};

/// Per-epoch statistics emitted by `train_epochs`.
///
/// When a `progress_tx` channel is configured in `TrainConfig`, the driver
/// sends one `EpochStats` value at the end of every completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Total epochs requested for this run.
    pub total_epochs: usize,
    /// Mean training loss over the batches of this epoch.
    pub train_loss: f64,
    /// Mean loss on the validation input, if one was provided.
    pub val_loss: Option<f64>,
    /// Solver updates run in this epoch.
    pub n_iterations: usize,
    /// Wall-clock duration of this single epoch in milliseconds.
    pub elapsed_ms: u64,
}
