use std::sync::atomic::Ordering;
use std::time::Instant;

use log::info;

use crate::errors::NnError;
use crate::train::batch::{TrainingBatch, TrainingInput};
use crate::train::epoch_stats::EpochStats;
use crate::train::train_config::TrainConfig;

/// Runs `batch.compute(input)` once per epoch and returns the mean training
/// loss of the last completed epoch.
///
/// # Early termination
/// The driver stops before the requested epoch count if:
/// - the `progress_tx` receiver has been dropped, **or**
/// - `config.stop_flag` is set to `true`.
///
/// A failing epoch stops the driver with that error; updates of earlier
/// epochs are kept.
pub fn train_epochs(
    batch: &mut TrainingBatch,
    input: &TrainingInput,
    validation: Option<&TrainingInput>,
    config: &TrainConfig,
) -> Result<f64, NnError> {
    let mut last_train_loss = 0.0;

    for epoch in 1..=config.epochs {
        if stop_requested(config) {
            break;
        }

        let t_start = Instant::now();
        let report = batch.compute(input)?;
        last_train_loss = report.loss;

        let val_loss = validation.map(|v| batch.evaluate(v)).transpose()?;
        let elapsed_ms = t_start.elapsed().as_millis() as u64;

        let stats = EpochStats {
            epoch,
            total_epochs: config.epochs,
            train_loss: report.loss,
            val_loss,
            n_iterations: report.n_iterations,
            elapsed_ms,
        };
        info!("epoch {epoch}/{}: loss {:.6}", config.epochs, report.loss);

        if let Some(ref tx) = config.progress_tx {
            // receiver gone: nobody is listening any more
            if tx.send(stats).is_err() {
                break;
            }
        }
    }

    Ok(last_train_loss)
}

fn stop_requested(config: &TrainConfig) -> bool {
    config.stop_flag.as_ref().map_or(false, |flag| flag.load(Ordering::Relaxed))
}
