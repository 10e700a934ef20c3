pub mod prediction;

pub use prediction::{PredictionBatch, PredictionResult};
