//! Map/reduce training.
//!
//! Every worker runs [`DistributedStep1Local`] on its shard and produces a
//! [`PartialResult`]. The master combines the partials with
//! [`DistributedStep2Master`], weighting each by its sample count, and runs a
//! single solver step on the model.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::NnError;
use crate::math::tensor::Tensor;
use crate::network::model::{Model, ModelMode, ModelParameter};
use crate::network::topology::Topology;
use crate::network::weights::PackedParameters;
use crate::train::adapter::SolverAdapter;
use crate::train::batch::{batch_dims, iteration_count, run_iteration, validate_input, TrainingInput, TrainingParameter};

/// Output of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    /// Mean of the per-batch derivative tables over the worker's batches.
    pub derivatives: Tensor,
    pub n_samples: usize,
    pub n_iterations: usize,
    /// Mean loss over the worker's batches.
    pub loss: f64,
}

/// Partials keyed by worker id. Iteration follows the key order, so the
/// reduction does not depend on the order the partials arrived in.
pub type DistributedPartialResult = BTreeMap<usize, PartialResult>;

/// Worker side: forward and backward passes over the local shard without
/// touching the weights.
#[derive(Debug)]
pub struct DistributedStep1Local {
    batch_size: usize,
    model: Option<Model>,
}

impl DistributedStep1Local {
    pub fn new(batch_size: usize) -> DistributedStep1Local {
        DistributedStep1Local { batch_size, model: None }
    }

    pub fn initialize(&mut self, data_dims: &[usize], topology: &Topology, parameter: &ModelParameter) -> Result<(), NnError> {
        let dims = batch_dims(data_dims, self.batch_size)?;
        let mut model = Model::from_topology(topology, ModelMode::Training)?;
        model.allocate(&dims, parameter)?;
        self.model = Some(model);
        Ok(())
    }

    pub fn set_model(&mut self, model: Model) {
        self.model = Some(model);
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> Option<&mut Model> {
        self.model.as_mut()
    }

    pub fn compute(&mut self, input: &TrainingInput) -> Result<PartialResult, NnError> {
        let model = self.model.as_mut().ok_or(NnError::NullModel)?;
        let sinks = validate_input(model, self.batch_size, input)?;
        let n_iterations = iteration_count(input.n_samples(), self.batch_size);

        let mut accumulated = vec![0.0; model.derivatives()?.layout().total_size()];
        let mut total_loss = 0.0;
        for iteration in 0..n_iterations {
            let start = iteration * self.batch_size;
            total_loss += run_iteration(model, input, &sinks, start, self.batch_size, true)?;
            let derivatives = model.derivatives()?.copy_to_table()?;
            for (acc, d) in accumulated.iter_mut().zip(derivatives.data().iter()) {
                *acc += d;
            }
        }

        let scale = 1.0 / n_iterations as f64;
        accumulated.iter_mut().for_each(|v| *v *= scale);
        let len = accumulated.len();
        let partial = PartialResult {
            derivatives: Tensor::from_vec(&[len], accumulated)?,
            n_samples: n_iterations * self.batch_size,
            n_iterations,
            loss: total_loss * scale,
        };
        debug!("local step over {} samples, loss {:.6}", partial.n_samples, partial.loss);
        Ok(partial)
    }
}

/// Result of a master step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step2Report {
    /// Solver updates applied (one per step).
    pub n_iterations: usize,
    pub n_samples: usize,
    pub n_partials: usize,
    /// Sample-weighted mean of the partial losses.
    pub loss: f64,
}

#[derive(Debug, Clone)]
struct Accumulator {
    weighted_sum: Vec<f64>,
    weighted_loss: f64,
    n_samples: usize,
    n_partials: usize,
}

/// Master side: sample-weighted mean of the partial derivatives, then one
/// solver step.
///
/// Partials can be reduced all at once with [`compute`](Self::compute) or
/// streamed in with [`add_partial`](Self::add_partial) and applied with
/// [`finalize_compute`](Self::finalize_compute).
#[derive(Debug)]
pub struct DistributedStep2Master {
    parameter: TrainingParameter,
    model: Option<Model>,
    adapter: SolverAdapter,
    accumulator: Option<Accumulator>,
}

impl DistributedStep2Master {
    pub fn new(parameter: TrainingParameter) -> DistributedStep2Master {
        let mut adapter = SolverAdapter::new();
        adapter.init(parameter.solver.as_ref());
        DistributedStep2Master { parameter, model: None, adapter, accumulator: None }
    }

    pub fn initialize(&mut self, data_dims: &[usize], topology: &Topology) -> Result<(), NnError> {
        let dims = batch_dims(data_dims, self.parameter.batch_size)?;
        let mut model = Model::from_topology(topology, ModelMode::Training)?;
        model.allocate(&dims, &self.parameter.model)?;
        self.model = Some(model);
        Ok(())
    }

    pub fn set_model(&mut self, model: Model) {
        self.model = Some(model);
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn into_model(self) -> Option<Model> {
        self.model
    }

    /// Folds one partial into the running sums.
    pub fn add_partial(&mut self, partial: &PartialResult) -> Result<(), NnError> {
        let model = self.model.as_ref().ok_or(NnError::NullModel)?;
        let total = model.weights_and_biases()?.layout().total_size();
        if partial.derivatives.len() != total {
            return Err(NnError::size_mismatch("partial derivatives", &[total], partial.derivatives.dims()));
        }
        let accumulator = self.accumulator.get_or_insert_with(|| Accumulator {
            weighted_sum: vec![0.0; total],
            weighted_loss: 0.0,
            n_samples: 0,
            n_partials: 0,
        });
        let weight = partial.n_samples as f64;
        for (acc, d) in accumulator.weighted_sum.iter_mut().zip(partial.derivatives.data().iter()) {
            *acc += weight * d;
        }
        accumulator.weighted_loss += weight * partial.loss;
        accumulator.n_samples += partial.n_samples;
        accumulator.n_partials += 1;
        Ok(())
    }

    /// Reduces every partial of `partials` and applies the solver step.
    /// On failure nothing stays accumulated.
    pub fn compute(&mut self, partials: &DistributedPartialResult) -> Result<Step2Report, NnError> {
        if partials.is_empty() {
            return Err(NnError::NullOutputCollection("no partial results".into()));
        }
        self.accumulator = None;
        for (worker, partial) in partials {
            debug!("reducing partial of worker {worker} ({} samples)", partial.n_samples);
            if let Err(e) = self.add_partial(partial) {
                self.accumulator = None;
                return Err(e);
            }
        }
        self.finalize_compute()
    }

    /// Applies one solver step along the accumulated mean derivative and
    /// clears the accumulator.
    pub fn finalize_compute(&mut self) -> Result<Step2Report, NnError> {
        let accumulator = self
            .accumulator
            .take()
            .ok_or_else(|| NnError::NullOutputCollection("no partial results".into()))?;
        if accumulator.n_samples == 0 {
            return Err(NnError::incorrect_parameter("partial results cover no samples"));
        }
        let model = self.model.as_mut().ok_or(NnError::NullModel)?;

        let scale = 1.0 / accumulator.n_samples as f64;
        let mean: Vec<f64> = accumulator.weighted_sum.iter().map(|v| v * scale).collect();
        let gradient = Tensor::from_vec(&[mean.len()], mean)?;
        let weights = model.weights_and_biases()?.copy_to_table()?;
        let updated = self.adapter.update_weights_and_biases(&weights, &gradient)?;
        model.weights_and_biases_mut()?.copy_from_table(&updated)?;

        let report = Step2Report {
            n_iterations: 1,
            n_samples: accumulator.n_samples,
            n_partials: accumulator.n_partials,
            loss: accumulator.weighted_loss * scale,
        };
        info!(
            "merged {} partials over {} samples, loss {:.6}",
            report.n_partials, report.n_samples, report.loss
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{ActivationLayer, DenseLayer, LossLayer};
    use crate::optim::{PrecomputedObjective, Sgd};
    use approx::assert_relative_eq;

    fn topology() -> Topology {
        let mut topology = Topology::new();
        topology.push_back(ActivationLayer::identity());
        topology.push_back(DenseLayer::new(1));
        topology.push_back(LossLayer::mse());
        topology.add_next(0, 1).unwrap();
        topology.add_next(1, 2).unwrap();
        topology
    }

    fn master() -> DistributedStep2Master {
        let solver = Sgd::new(Box::new(PrecomputedObjective::new()), 1.0);
        let mut master = DistributedStep2Master::new(TrainingParameter::new(Box::new(solver)));
        master.initialize(&[1, 1], &topology()).unwrap();
        master
    }

    fn partial(derivatives: Vec<f64>, n_samples: usize) -> PartialResult {
        PartialResult {
            derivatives: Tensor::from_vec(&[derivatives.len()], derivatives).unwrap(),
            n_samples,
            n_iterations: 1,
            loss: 0.0,
        }
    }

    #[test]
    fn test_weighted_mean_step() {
        // one dense layer 1 -> 1: two parameters
        let mut master = master();
        let before = master.model().unwrap().get_weights_and_biases().unwrap().to_vec();
        let mut partials = DistributedPartialResult::new();
        partials.insert(0, partial(vec![1.0, 0.0], 1));
        partials.insert(1, partial(vec![4.0, 3.0], 2));

        let report = master.compute(&partials).unwrap();
        assert_eq!(report.n_samples, 3);
        assert_eq!(report.n_iterations, 1);
        let after = master.model().unwrap().get_weights_and_biases().unwrap().to_vec();
        // mean = (1*[1,0] + 2*[4,3]) / 3 = [3, 2]
        assert_relative_eq!(before[0] - after[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(before[1] - after[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_and_mismatched_partials() {
        let mut master = master();
        assert!(matches!(
            master.compute(&DistributedPartialResult::new()),
            Err(NnError::NullOutputCollection(_))
        ));
        assert!(master.add_partial(&partial(vec![1.0], 1)).is_err());
        assert!(matches!(master.finalize_compute(), Err(NnError::NullOutputCollection(_))));
    }

    #[test]
    fn test_failed_reduction_discards_accumulated_partials() {
        let mut master = master();
        let before = master.model().unwrap().get_weights_and_biases().unwrap();
        let mut partials = DistributedPartialResult::new();
        partials.insert(0, partial(vec![1.0, 1.0], 1));
        partials.insert(1, partial(vec![1.0], 1));

        assert!(master.compute(&partials).is_err());
        assert!(matches!(master.finalize_compute(), Err(NnError::NullOutputCollection(_))));
        assert_eq!(master.model().unwrap().get_weights_and_biases().unwrap(), before);
    }
}
