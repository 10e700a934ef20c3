use serde::{Deserialize, Serialize};

use crate::errors::NnError;
use crate::layers::registry::LayerRegistry;
use crate::math::tensor::Tensor;
use crate::network::model::{Model, ModelMode, ModelParameter};
use crate::network::topology::{LayerRecord, Topology};
use crate::network::weights::{PackedParameters, StorageKind};

/// Optional annotations stored next to a model.
/// All fields are optional so archives without them load cleanly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub description: Option<String>,
    /// Human-readable labels of the sink outputs (e.g. class names).
    pub output_labels: Option<Vec<String>>,
}

/// Persisted form of a model: layer records with their edges, and, for an
/// allocated model, the sample dims, the storage strategy and the packed
/// parameter table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArchive {
    pub mode: ModelMode,
    pub layers: Vec<LayerRecord>,
    #[serde(default)]
    pub sample_dims: Option<Vec<usize>>,
    #[serde(default)]
    pub storage: Option<StorageKind>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub weights_and_biases: Option<Tensor>,
    #[serde(default)]
    pub metadata: ModelMetadata,
}

impl ModelArchive {
    /// Serializes the archive to a pretty-printed JSON file.
    pub fn save_json(&self, path: &str) -> Result<(), NnError> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Deserializes an archive previously written by `save_json`.
    pub fn load_json(path: &str) -> Result<ModelArchive, NnError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

impl Model {
    pub fn to_archive(&self) -> Result<ModelArchive, NnError> {
        let (storage, seed, weights_and_biases) = if self.is_allocated() {
            let store = self.weights_and_biases()?;
            (Some(store.kind()), Some(self.parameter().seed), Some(store.copy_to_table()?))
        } else {
            (None, None, None)
        };
        Ok(ModelArchive {
            mode: self.mode(),
            layers: self.topology()?.to_records()?,
            sample_dims: self.sample_dims().map(<[usize]>::to_vec),
            storage,
            seed,
            weights_and_biases,
            metadata: self.metadata().clone(),
        })
    }

    /// Rebuilds a model, re-creating its layers through `registry`. An
    /// archived allocation is replayed and the parameter table restored.
    pub fn from_archive(archive: ModelArchive, registry: &LayerRegistry) -> Result<Model, NnError> {
        let topology = Topology::from_records(archive.layers, registry)?;
        let mut model = Model::from_topology(&topology, archive.mode)?;
        model.set_metadata(archive.metadata);
        if let Some(dims) = archive.sample_dims {
            let mut parameter = ModelParameter::default();
            if let Some(kind) = archive.storage {
                parameter.storage = kind.into();
            }
            if let Some(seed) = archive.seed {
                parameter.seed = seed;
            }
            model.allocate(&dims, &parameter)?;
            if let Some(table) = &archive.weights_and_biases {
                model.set_weights_and_biases(table)?;
            }
        }
        Ok(model)
    }

    pub fn save_json(&self, path: &str) -> Result<(), NnError> {
        self.to_archive()?.save_json(path)
    }

    pub fn load_json(path: &str, registry: &LayerRegistry) -> Result<Model, NnError> {
        Model::from_archive(ModelArchive::load_json(path)?, registry)
    }
}
