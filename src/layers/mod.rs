pub mod activation;
pub mod concat;
pub mod dense;
pub mod input;
pub mod layer;
pub mod loss;
pub mod registry;

pub use activation::{ActivationFunction, ActivationLayer};
pub use concat::ConcatLayer;
pub use dense::DenseLayer;
pub use input::{InputEntry, LayerInput, DATA_SLOT, GROUND_TRUTH_SLOT};
pub use layer::{BackwardLayer, BackwardResult, ForwardContext, ForwardLayer, Layer, LayerParameter};
pub use loss::{LossLayer, LossType};
pub use registry::{LayerConstructor, LayerRegistry};
