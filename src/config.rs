use serde::{Deserialize, Serialize};

use crate::errors::{ErrorCollection, NnError};
use crate::network::model::{ModelParameter, StoragePreference};
use crate::optim::{PrecomputedObjective, Sgd};
use crate::train::{TrainConfig, TrainingParameter};

/// Hyperparameters of a training run, loadable from JSON.
///
/// Every field is optional in the file; missing ones take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub storage: StoragePreference,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_batch_size() -> usize {
    1
}

fn default_epochs() -> usize {
    10
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_seed() -> u64 {
    ModelParameter::default().seed
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            momentum: 0.0,
            storage: StoragePreference::Automatic,
            seed: default_seed(),
        }
    }
}

impl TrainingConfig {
    pub fn save_json(&self, path: &str) -> Result<(), NnError> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load_json(path: &str) -> Result<TrainingConfig, NnError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Reports every out-of-range value at once.
    pub fn validate(&self) -> Result<(), NnError> {
        let mut errors = ErrorCollection::new();
        if self.batch_size == 0 {
            errors.add(NnError::incorrect_parameter("batch_size must be at least 1"));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            errors.add(NnError::IncorrectParameter(format!("learning_rate {} is not positive", self.learning_rate)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            errors.add(NnError::IncorrectParameter(format!("momentum {} is outside [0, 1)", self.momentum)));
        }
        errors.into_result()
    }

    pub fn model_parameter(&self) -> ModelParameter {
        ModelParameter { storage: self.storage, seed: self.seed }
    }

    /// Batch training parameters with an SGD solver.
    pub fn to_parameter(&self) -> Result<TrainingParameter, NnError> {
        self.validate()?;
        let solver = Sgd::new(Box::new(PrecomputedObjective::new()), self.learning_rate).with_momentum(self.momentum);
        Ok(TrainingParameter::new(Box::new(solver))
            .with_batch_size(self.batch_size)
            .with_model_parameter(self.model_parameter()))
    }

    pub fn train_config(&self) -> TrainConfig {
        TrainConfig::new(self.epochs)
    }
}
