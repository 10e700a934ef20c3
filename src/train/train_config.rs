use std::sync::mpsc;
use std::sync::{atomic::AtomicBool, Arc};

use crate::train::epoch_stats::EpochStats;

/// Configuration for a `train_epochs` run.
///
/// # Fields
/// - `epochs`:       number of training calls (full passes over the input)
/// - `progress_tx`:  optional channel sender; one `EpochStats` is sent per
///                   completed epoch. If the receiver is dropped the driver
///                   stops early.
/// - `stop_flag`:    optional atomic flag; when set to `true` from another
///                   thread the driver stops after the current epoch.
#[derive(Debug, Default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub progress_tx: Option<mpsc::Sender<EpochStats>>,
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl TrainConfig {
    /// Creates a `TrainConfig` with no progress channel and no stop flag.
    pub fn new(epochs: usize) -> Self {
        TrainConfig { epochs, progress_tx: None, stop_flag: None }
    }

    pub fn with_progress(mut self, progress_tx: mpsc::Sender<EpochStats>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    pub fn with_stop_flag(mut self, stop_flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(stop_flag);
        self
    }
}
