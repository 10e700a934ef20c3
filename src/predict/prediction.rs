use std::collections::BTreeMap;

use log::debug;

use crate::errors::NnError;
use crate::math::tensor::Tensor;
use crate::network::model::{Model, ModelMode};
use crate::train::batch::{batch_dims, iteration_count};

/// Outputs of every sink layer, keyed by layer index. Each tensor has one
/// row per predicted sample.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub outputs: BTreeMap<usize, Tensor>,
    pub n_samples: usize,
}

impl PredictionResult {
    pub fn output(&self, sink: usize) -> Option<&Tensor> {
        self.outputs.get(&sink)
    }
}

/// Forward passes over full batches of samples.
#[derive(Debug, Clone)]
pub struct PredictionBatch {
    batch_size: usize,
}

impl PredictionBatch {
    pub fn new(batch_size: usize) -> PredictionBatch {
        PredictionBatch { batch_size }
    }

    /// Runs `model` over the rows of `data`. The model is re-allocated for
    /// this batch size when needed; its parameters are kept. Trailing samples
    /// that do not fill a batch are skipped.
    pub fn compute(&self, model: &mut Model, data: &Tensor) -> Result<PredictionResult, NnError> {
        if model.mode() != ModelMode::Prediction {
            return Err(NnError::incorrect_parameter("prediction needs a model in prediction mode"));
        }
        let n_samples = data.leading_dim();
        if self.batch_size > n_samples {
            return Err(NnError::IncorrectParameter(format!(
                "batch size {} exceeds the number of samples {n_samples}",
                self.batch_size
            )));
        }
        let dims = batch_dims(data.dims(), self.batch_size)?;
        let parameter = model.parameter().clone();
        model.allocate(&dims, &parameter)?;

        let n_iterations = iteration_count(n_samples, self.batch_size);
        let sinks = model.sinks();
        let mut values: Vec<Vec<f64>> = vec![Vec::new(); sinks.len()];
        let mut row_dims: Vec<Vec<usize>> = vec![Vec::new(); sinks.len()];
        for iteration in 0..n_iterations {
            model.set_input(data.sub_tensor(iteration * self.batch_size, self.batch_size)?)?;
            model.forward()?;
            for (k, &sink) in sinks.iter().enumerate() {
                let result = model
                    .result(sink)
                    .ok_or_else(|| NnError::NullResult(format!("result of layer {sink}")).in_layer(sink))?;
                values[k].extend_from_slice(&result.data());
                row_dims[k] = result.dims().get(1..).unwrap_or(&[]).to_vec();
            }
        }

        let n_predicted = n_iterations * self.batch_size;
        let mut outputs = BTreeMap::new();
        for ((sink, data), rows) in sinks.into_iter().zip(values).zip(row_dims) {
            let mut dims = vec![n_predicted];
            dims.extend(rows);
            outputs.insert(sink, Tensor::from_vec(&dims, data)?);
        }
        debug!("predicted {n_predicted} samples over {} sinks", outputs.len());
        Ok(PredictionResult { outputs, n_samples: n_predicted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{ActivationFunction, ActivationLayer, DenseLayer};
    use crate::network::model::ModelParameter;
    use crate::network::topology::Topology;

    fn model() -> Model {
        let w = Tensor::from_vec(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let b = Tensor::from_vec(&[2], vec![0.0, 0.0]).unwrap();
        let mut topology = Topology::new();
        topology.push_back(ActivationLayer::identity());
        topology.push_back(DenseLayer::new(2).with_weights_and_biases(w, b));
        topology.push_back(ActivationLayer::new(ActivationFunction::ReLU));
        topology.add_next(0, 1).unwrap();
        topology.add_next(1, 2).unwrap();
        Model::from_topology(&topology, ModelMode::Prediction).unwrap()
    }

    #[test]
    fn test_outputs_cover_every_batch() {
        let mut model = model();
        model.allocate(&[1, 2], &ModelParameter::default()).unwrap();
        let data = Tensor::from_rows(&[vec![1.0, -1.0], vec![-2.0, 2.0], vec![3.0, 3.0]]).unwrap();
        let result = PredictionBatch::new(3).compute(&mut model, &data).unwrap();
        let out = result.output(2).unwrap();
        assert_eq!(out.dims(), &[3, 2]);
        assert_eq!(out.to_vec(), vec![1.0, 0.0, 0.0, 2.0, 3.0, 3.0]);
        assert_eq!(model.batch_size(), Some(3));
    }

    #[test]
    fn test_rejects_training_model() {
        let mut topology = Topology::new();
        topology.push_back(ActivationLayer::identity());
        let mut model = Model::from_topology(&topology, ModelMode::Training).unwrap();
        let data = Tensor::zeros(&[2, 1]).unwrap();
        assert!(PredictionBatch::new(1).compute(&mut model, &data).is_err());
    }
}
