//! Layer-graph neural network engine: a topology of layers is wired into a
//! model whose learnable parameters are packed into one table, trained batch
//! by batch or map/reduce style against a generic iterative solver.

pub mod config;
pub mod errors;
pub mod layers;
pub mod math;
pub mod network;
pub mod optim;
pub mod predict;
pub mod train;

// Convenience re-exports
pub use config::TrainingConfig;
pub use errors::{ErrorCollection, NnError};
pub use layers::{
    ActivationFunction, ActivationLayer, ConcatLayer, DenseLayer, Layer, LayerRegistry, LossLayer, LossType,
};
pub use math::{Initializer, Tensor};
pub use network::{Model, ModelArchive, ModelMode, ModelParameter, StoragePreference, Topology};
pub use optim::{IterativeSolver, PrecomputedObjective, Sgd};
pub use predict::PredictionBatch;
pub use train::{
    train_epochs, DistributedStep1Local, DistributedStep2Master, TrainConfig, TrainingBatch, TrainingInput,
    TrainingParameter,
};
