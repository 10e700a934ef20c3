use log::{debug, info, warn};

use crate::errors::{ErrorCollection, NnError};
use crate::layers::layer::BackwardLayer;
use crate::math::tensor::Tensor;
use crate::network::model::{Model, ModelMode, ModelParameter};
use crate::network::topology::Topology;
use crate::network::weights::PackedParameters;
use crate::optim::solver::IterativeSolver;
use crate::train::adapter::SolverAdapter;

/// Parameters of a batch training call.
#[derive(Debug, Clone)]
pub struct TrainingParameter {
    /// Samples per solver update.
    pub batch_size: usize,
    /// Prototype cloned by the solver adapter.
    pub solver: Box<dyn IterativeSolver>,
    /// Used when the batch builds its own model.
    pub model: ModelParameter,
}

impl TrainingParameter {
    pub fn new(solver: Box<dyn IterativeSolver>) -> TrainingParameter {
        TrainingParameter { batch_size: 1, solver, model: ModelParameter::default() }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> TrainingParameter {
        self.batch_size = batch_size;
        self
    }

    pub fn with_model_parameter(mut self, model: ModelParameter) -> TrainingParameter {
        self.model = model;
        self
    }
}

/// Expected outputs of the sink layers.
#[derive(Debug, Clone)]
pub enum GroundTruth {
    /// One tensor read by every sink.
    Single(Tensor),
    /// One tensor per sink, in ascending sink index order.
    PerSink(Vec<Tensor>),
}

/// Samples along the leading dimension of `data`, with their ground truth.
#[derive(Debug, Clone)]
pub struct TrainingInput {
    pub data: Tensor,
    pub ground_truth: GroundTruth,
}

impl TrainingInput {
    pub fn new(data: Tensor, ground_truth: Tensor) -> TrainingInput {
        TrainingInput { data, ground_truth: GroundTruth::Single(ground_truth) }
    }

    pub fn per_sink(data: Tensor, ground_truth: Vec<Tensor>) -> TrainingInput {
        TrainingInput { data, ground_truth: GroundTruth::PerSink(ground_truth) }
    }

    pub fn n_samples(&self) -> usize {
        self.data.leading_dim()
    }

    fn ground_truth_for(&self, sink_ordinal: usize) -> Option<&Tensor> {
        match &self.ground_truth {
            GroundTruth::Single(tensor) => Some(tensor),
            GroundTruth::PerSink(tensors) => tensors.get(sink_ordinal),
        }
    }
}

/// Outcome of one training call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Solver updates run.
    pub n_iterations: usize,
    /// Samples consumed; trailing samples that do not fill a batch are skipped.
    pub n_samples: usize,
    /// Mean loss over the iterations, summed over loss sinks.
    pub loss: f64,
}

/// Checks everything a training pass needs before any layer runs and
/// returns the sink layers. Every problem found is reported.
pub(crate) fn validate_input(model: &Model, batch_size: usize, input: &TrainingInput) -> Result<Vec<usize>, NnError> {
    let mut errors = ErrorCollection::new();
    let n_samples = input.n_samples();
    if batch_size == 0 {
        errors.add(NnError::incorrect_parameter("batch size must be at least 1"));
    } else if batch_size > n_samples {
        errors.add(NnError::IncorrectParameter(format!(
            "batch size {batch_size} exceeds the number of samples {n_samples}"
        )));
    }
    let sinks = model.sinks();
    if model.mode() != ModelMode::Training {
        errors.add(NnError::incorrect_parameter("training needs a model in training mode"));
    } else if !sinks
        .iter()
        .any(|&sink| model.backward_layer(sink).is_some_and(|l| !l.requires_input_gradient()))
    {
        // every backward stage would be skipped and the derivatives stay zero
        errors.add(NnError::incorrect_parameter("no sink layer produces a gradient"));
    }
    match model.batch_size() {
        Some(allocated) if allocated == batch_size => {}
        allocated => errors.add(NnError::InconsistentModelAndBatchSizeInParameter {
            model: allocated.unwrap_or(0),
            parameter: batch_size,
        }),
    }
    if let Some(dims) = model.sample_dims() {
        if input.data.dims().get(1..) != dims.get(1..) {
            errors.add(NnError::size_mismatch("sample", &dims[1..], input.data.dims().get(1..).unwrap_or(&[])));
        }
    }

    if let GroundTruth::PerSink(tensors) = &input.ground_truth {
        if tensors.len() != sinks.len() {
            errors.add(NnError::IncorrectElementCountInCollection {
                collection: "ground truth".into(),
                expected: sinks.len(),
                actual: tensors.len(),
            });
        }
    }
    for ordinal in 0..sinks.len() {
        if let Some(truth) = input.ground_truth_for(ordinal) {
            if truth.leading_dim() != n_samples {
                errors.add(NnError::IncorrectElementCountInCollection {
                    collection: format!("ground truth of sink {}", sinks[ordinal]),
                    expected: n_samples,
                    actual: truth.leading_dim(),
                });
            }
        }
    }
    errors.into_result()?;
    Ok(sinks)
}

/// Number of full batches in `n_samples`; trailing samples are logged and skipped.
pub(crate) fn iteration_count(n_samples: usize, batch_size: usize) -> usize {
    let trailing = n_samples % batch_size;
    if trailing != 0 {
        warn!("{trailing} trailing samples do not fill a batch of {batch_size} and are skipped");
    }
    (n_samples / batch_size).max(1)
}

/// Forward and backward pass over rows `[start, start + batch_size)`.
/// Returns the summed loss of the sinks.
pub(crate) fn run_iteration(
    model: &mut Model,
    input: &TrainingInput,
    sinks: &[usize],
    start: usize,
    batch_size: usize,
    backward: bool,
) -> Result<f64, NnError> {
    model.set_input(input.data.sub_tensor(start, batch_size)?)?;
    for (ordinal, &sink) in sinks.iter().enumerate() {
        let truth = input
            .ground_truth_for(ordinal)
            .ok_or_else(|| NnError::NullTensor(format!("ground truth of sink {sink}")))?;
        model.set_ground_truth(sink, truth.sub_tensor(start, batch_size)?)?;
    }
    model.forward()?;
    if backward {
        model.backward()?;
    }
    Ok(sinks
        .iter()
        .filter_map(|&sink| model.forward_layer(sink).and_then(|l| l.loss_value()))
        .sum())
}

/// Single-pass batch training: one solver update per full batch of samples.
///
/// No epoch loop runs inside `compute`; call it again (or use
/// [`train_epochs`](crate::train::train_epochs)) for further passes. Updates
/// already applied when a later batch fails are kept.
#[derive(Debug)]
pub struct TrainingBatch {
    parameter: TrainingParameter,
    model: Option<Model>,
    adapter: SolverAdapter,
}

impl TrainingBatch {
    pub fn new(parameter: TrainingParameter) -> TrainingBatch {
        let mut adapter = SolverAdapter::new();
        adapter.init(parameter.solver.as_ref());
        TrainingBatch { parameter, model: None, adapter }
    }

    pub fn parameter(&self) -> &TrainingParameter {
        &self.parameter
    }

    /// Builds a training model from `topology` for samples shaped like
    /// `data_dims` (leading dimension ignored).
    pub fn initialize(&mut self, data_dims: &[usize], topology: &Topology) -> Result<(), NnError> {
        let dims = batch_dims(data_dims, self.parameter.batch_size)?;
        let mut model = Model::from_topology(topology, ModelMode::Training)?;
        model.allocate(&dims, &self.parameter.model)?;
        self.model = Some(model);
        Ok(())
    }

    /// Trains an existing model, e.g. one restored from an archive.
    pub fn set_model(&mut self, model: Model) {
        self.model = Some(model);
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> Option<&mut Model> {
        self.model.as_mut()
    }

    pub fn into_model(self) -> Option<Model> {
        self.model
    }

    pub fn adapter(&self) -> &SolverAdapter {
        &self.adapter
    }

    pub fn compute(&mut self, input: &TrainingInput) -> Result<TrainingReport, NnError> {
        let model = self.model.as_mut().ok_or(NnError::NullModel)?;
        let batch_size = self.parameter.batch_size;
        let sinks = validate_input(model, batch_size, input)?;
        let n_iterations = iteration_count(input.n_samples(), batch_size);

        let mut total_loss = 0.0;
        for iteration in 0..n_iterations {
            let start = iteration * batch_size;
            let loss = run_iteration(model, input, &sinks, start, batch_size, true)?;
            total_loss += loss;

            let derivatives = model.derivatives()?.copy_to_table()?;
            let weights = model.weights_and_biases()?.copy_to_table()?;
            let updated = self.adapter.update_weights_and_biases(&weights, &derivatives)?;
            model.weights_and_biases_mut()?.copy_from_table(&updated)?;
            debug!("iteration {iteration}: samples [{start}, {}) loss {loss:.6}", start + batch_size);
        }

        let report = TrainingReport {
            n_iterations,
            n_samples: n_iterations * batch_size,
            loss: total_loss / n_iterations as f64,
        };
        info!(
            "trained on {} samples in {} iterations, mean loss {:.6}",
            report.n_samples, report.n_iterations, report.loss
        );
        Ok(report)
    }

    /// Mean loss over full batches of `input`, without updating anything.
    pub fn evaluate(&mut self, input: &TrainingInput) -> Result<f64, NnError> {
        let model = self.model.as_mut().ok_or(NnError::NullModel)?;
        let batch_size = self.parameter.batch_size;
        let sinks = validate_input(model, batch_size, input)?;
        let n_iterations = iteration_count(input.n_samples(), batch_size);
        let mut total_loss = 0.0;
        for iteration in 0..n_iterations {
            total_loss += run_iteration(model, input, &sinks, iteration * batch_size, batch_size, false)?;
        }
        Ok(total_loss / n_iterations as f64)
    }
}

/// `[batch_size, data_dims[1..]...]`.
pub(crate) fn batch_dims(data_dims: &[usize], batch_size: usize) -> Result<Vec<usize>, NnError> {
    if data_dims.is_empty() {
        return Err(NnError::incorrect_parameter("data dims are empty"));
    }
    if batch_size == 0 {
        return Err(NnError::incorrect_parameter("batch size must be at least 1"));
    }
    let mut dims = data_dims.to_vec();
    dims[0] = batch_size;
    Ok(dims)
}
