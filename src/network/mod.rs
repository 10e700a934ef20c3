pub mod archive;
pub mod model;
pub mod propagation;
pub mod topology;
pub mod weights;

pub use archive::{ModelArchive, ModelMetadata};
pub use model::{Model, ModelMode, ModelParameter, StoragePreference};
pub use propagation::gradient_propagation_flags;
pub use topology::{validate_graph, LayerDescriptor, LayerRecord, Topology};
pub use weights::{PackedParameters, ParameterLayout, StorageKind, TableBacked, TensorBacked, WeightsAndBiases};
