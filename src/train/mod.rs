pub mod adapter;
pub mod batch;
pub mod distributed;
pub mod epoch_stats;
pub mod loop_fn;
pub mod train_config;

pub use adapter::SolverAdapter;
pub use batch::{GroundTruth, TrainingBatch, TrainingInput, TrainingParameter, TrainingReport};
pub use distributed::{
    DistributedPartialResult, DistributedStep1Local, DistributedStep2Master, PartialResult, Step2Report,
};
pub use epoch_stats::EpochStats;
pub use loop_fn::train_epochs;
pub use train_config::TrainConfig;
