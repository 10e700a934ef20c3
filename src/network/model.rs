use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::errors::NnError;
use crate::layers::input::DATA_SLOT;
use crate::layers::layer::{BackwardLayer, ForwardContext, ForwardLayer, Layer, LayerParameter};
use crate::math::tensor::Tensor;
use crate::network::archive::ModelMetadata;
use crate::network::propagation::gradient_propagation_flags;
use crate::network::topology::{validate_graph, LayerDescriptor, Topology};
use crate::network::weights::{
    PackedParameters, ParameterLayout, StorageKind, TableBacked, TensorBacked, WeightsAndBiases,
};

/// Prediction models only hold forward stages; training models hold the
/// forward/backward pair of every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    Prediction,
    Training,
}

/// How the parameter store is laid out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePreference {
    /// Tensors when any layer got caller-owned weights, one table otherwise.
    #[default]
    Automatic,
    Tensors,
    Table,
}

impl From<StorageKind> for StoragePreference {
    fn from(kind: StorageKind) -> StoragePreference {
        match kind {
            StorageKind::Tensors => StoragePreference::Tensors,
            StorageKind::Table => StoragePreference::Table,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParameter {
    #[serde(default)]
    pub storage: StoragePreference,
    /// Seed of the generator used by the weight initializers.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

impl Default for ModelParameter {
    fn default() -> Self {
        ModelParameter { storage: StoragePreference::Automatic, seed: default_seed() }
    }
}

/// A wired layer graph with its parameter store.
///
/// Layers are inserted first; `allocate` then wires every edge, lays out the
/// parameters and (for training) derives the gradient-propagation flags and
/// the backward wiring. Inserting a layer invalidates the allocation.
#[derive(Debug)]
pub struct Model {
    mode: ModelMode,
    prototypes: Vec<Box<dyn Layer>>,
    forward: Vec<Box<dyn ForwardLayer>>,
    backward: Vec<Box<dyn BackwardLayer>>,
    next_layers: Vec<Vec<usize>>,
    /// Predecessors of every layer, ascending.
    backward_next_layers: Vec<Vec<usize>>,
    propagate_gradient: Vec<bool>,
    weights_and_biases: Option<WeightsAndBiases>,
    derivatives: Option<WeightsAndBiases>,
    sample_dims: Option<Vec<usize>>,
    parameter: ModelParameter,
    metadata: ModelMetadata,
}

impl Model {
    pub fn new(mode: ModelMode) -> Model {
        Model {
            mode,
            prototypes: Vec::new(),
            forward: Vec::new(),
            backward: Vec::new(),
            next_layers: Vec::new(),
            backward_next_layers: Vec::new(),
            propagate_gradient: Vec::new(),
            weights_and_biases: None,
            derivatives: None,
            sample_dims: None,
            parameter: ModelParameter::default(),
            metadata: ModelMetadata::default(),
        }
    }

    /// Empty model with every layer of `topology` inserted.
    pub fn from_topology(topology: &Topology, mode: ModelMode) -> Result<Model, NnError> {
        let mut model = Model::new(mode);
        for descriptor in topology.iter() {
            model.insert_layer(descriptor)?;
        }
        Ok(model)
    }

    /// Replaces the layers with those of `topology` and allocates for `sample_dims`.
    pub fn initialize(
        &mut self,
        sample_dims: &[usize],
        topology: &Topology,
        parameter: &ModelParameter,
    ) -> Result<(), NnError> {
        let metadata = std::mem::take(&mut self.metadata);
        *self = Model::from_topology(topology, self.mode)?;
        self.metadata = metadata;
        self.allocate(sample_dims, parameter)
    }

    /// Clones the descriptor's layer into the model. Indices must be inserted
    /// in order, starting at 0.
    pub fn insert_layer(&mut self, descriptor: &LayerDescriptor) -> Result<(), NnError> {
        let expected = self.forward.len();
        if descriptor.index() != expected {
            return Err(NnError::IncorrectParameter(format!(
                "layer inserted with index {}, expected {expected}",
                descriptor.index()
            )));
        }
        let layer = descriptor.layer();
        self.forward.push(layer.forward_layer());
        if self.mode == ModelMode::Training {
            self.backward.push(layer.backward_layer());
        }
        self.prototypes.push(layer.clone_layer());
        self.next_layers.push(descriptor.next_layers().to_vec());
        self.sample_dims = None;
        Ok(())
    }

    /// Wires the graph for inputs of `sample_dims` (leading dimension is the
    /// batch size) and builds the parameter store.
    ///
    /// Calling it again with the same dims is a no-op. With other dims the
    /// graph is re-wired and the current parameter values are kept. A failed
    /// call leaves the model unallocated.
    pub fn allocate(&mut self, sample_dims: &[usize], parameter: &ModelParameter) -> Result<(), NnError> {
        if self.sample_dims.as_deref() == Some(sample_dims) {
            debug!("model already allocated for {sample_dims:?}");
            return Ok(());
        }
        if self.forward.is_empty() {
            return Err(NnError::NullModel);
        }
        if sample_dims.first().map_or(true, |&rows| rows == 0) {
            return Err(NnError::IncorrectParameter(format!("sample dims {sample_dims:?} have no rows")));
        }
        validate_graph(&self.next_layers)?;

        self.sample_dims = None;
        self.propagate_gradient.clear();
        self.derivatives = None;

        let count = self.forward.len();
        self.backward_next_layers = vec![Vec::new(); count];
        for (from, next) in self.next_layers.iter().enumerate() {
            for &to in next {
                self.backward_next_layers[to].push(from);
            }
        }

        for layer in self.forward.iter_mut() {
            if self.mode == ModelMode::Training {
                // a backward stage reads the forward input it was computed from
                layer.parameter_mut().allow_inplace_computation = false;
            }
            layer.initialize_input();
        }
        self.forward[0].allocate_input(sample_dims).map_err(|e| e.in_layer(0))?;

        let mut weight_dims = Vec::with_capacity(count);
        let mut bias_dims = Vec::with_capacity(count);
        for i in 0..count {
            self.connect_forward_layers(i).map_err(|e| e.in_layer(i))?;
            weight_dims.push(self.forward[i].weights_dims().map_err(|e| e.in_layer(i))?);
            bias_dims.push(self.forward[i].biases_dims().map_err(|e| e.in_layer(i))?);
        }

        let layout = ParameterLayout::new(weight_dims, bias_dims)?;
        let previous = match self.weights_and_biases.take() {
            Some(store) if store.layout() == &layout => Some(store.copy_to_table()?.deep_copy()),
            _ => None,
        };
        let kind = self.storage_kind(parameter.storage);
        let mut store = build_weights_and_biases(&mut self.forward, layout.clone(), kind, parameter.seed)?;
        if let Some(values) = previous {
            store.copy_from_table(&values)?;
        }
        debug!(
            "allocated {count} layers for {sample_dims:?}: {} parameters in {:?} storage",
            layout.total_size(),
            kind
        );
        self.weights_and_biases = Some(store);

        if self.mode == ModelMode::Training {
            let has_weights: Vec<bool> = (0..count).map(|i| layout.layer_size(i) > 0).collect();
            self.propagate_gradient = gradient_propagation_flags(&self.next_layers, &has_weights);
            for i in 0..count {
                let flag = self.propagate_gradient[i];
                self.forward[i].parameter_mut().propagate_gradient = flag;
                self.backward[i].parameter_mut().propagate_gradient = flag;
            }
            self.derivatives = Some(self.allocate_backward_layers(layout, kind)?);
            for i in (0..count).rev() {
                self.connect_backward_layers(i).map_err(|e| e.in_layer(i))?;
            }
        }

        self.sample_dims = Some(sample_dims.to_vec());
        self.parameter = parameter.clone();
        Ok(())
    }

    fn storage_kind(&self, preference: StoragePreference) -> StorageKind {
        match preference {
            StoragePreference::Tensors => StorageKind::Tensors,
            StoragePreference::Table => StorageKind::Table,
            StoragePreference::Automatic => {
                let caller_owned = self.forward.iter().any(|l| l.parameter().weights_and_biases_initialized);
                if caller_owned {
                    StorageKind::Tensors
                } else {
                    StorageKind::Table
                }
            }
        }
    }

    /// Allocates layer `i`'s result and hands it to every successor. A result
    /// read by several successors is marked shared in each of them.
    fn connect_forward_layers(&mut self, i: usize) -> Result<(), NnError> {
        self.forward[i].allocate_result()?;
        let result = self
            .forward[i]
            .result()
            .ok_or_else(|| NnError::NullResult(format!("result of layer {i}")))?;
        let fan_out = self.next_layers[i].len() > 1;
        for (ordinal, &j) in self.next_layers[i].iter().enumerate() {
            let consumer = &mut self.forward[j];
            consumer.add_input(result.clone(), ordinal, DATA_SLOT)?;
            if fan_out {
                let position = consumer.input().len() - 1;
                consumer.input_mut().mark_shared(position);
            }
        }
        Ok(())
    }

    fn allocate_backward_layers(&mut self, layout: ParameterLayout, kind: StorageKind) -> Result<WeightsAndBiases, NnError> {
        let count = self.backward.len();
        let table = match kind {
            StorageKind::Table => Some(TableBacked::new(layout.clone())?),
            StorageKind::Tensors => None,
        };
        let mut weights = Vec::with_capacity(count);
        let mut biases = Vec::with_capacity(count);
        for i in 0..count {
            let backward = &mut self.backward[i];
            backward.input_mut().clear();
            if let Some(table) = &table {
                if layout.layer_size(i) > 0 {
                    backward.set_derivatives(table.weights_view(i)?, table.biases_view(i)?);
                }
            }
            let context = ForwardContext::capture(self.forward[i].as_ref()).map_err(|e| e.in_layer(i))?;
            backward.set_forward_context(context);
            backward.allocate_result().map_err(|e| e.in_layer(i))?;

            let result = backward
                .result()
                .ok_or_else(|| NnError::NullResult(format!("gradient of layer {i}")).in_layer(i))?;
            let learnable = layout.layer_size(i) > 0;
            weights.push(result.weight_derivatives.clone().filter(|_| learnable));
            biases.push(result.bias_derivatives.clone().filter(|_| learnable));
        }
        match table {
            Some(table) => Ok(WeightsAndBiases::Table(table)),
            None => Ok(WeightsAndBiases::Tensors(TensorBacked::new(layout, weights, biases)?)),
        }
    }

    /// Hands layer `i`'s input gradients to its predecessors. Predecessor
    /// `p` receives the gradient at the position of the edge `p -> i` in its
    /// own edge list. Layers that do not propagate are gradient sinks.
    fn connect_backward_layers(&mut self, i: usize) -> Result<(), NnError> {
        if !self.propagate_gradient[i] || self.backward_next_layers[i].is_empty() {
            return Ok(());
        }
        let gradients = self.backward[i]
            .result()
            .ok_or_else(|| NnError::NullResult(format!("gradient of layer {i}")))?
            .input_gradients
            .clone();
        let predecessors = &self.backward_next_layers[i];
        if gradients.len() != predecessors.len() {
            return Err(NnError::IncorrectElementCountInCollection {
                collection: format!("input gradients of layer {i}"),
                expected: predecessors.len(),
                actual: gradients.len(),
            });
        }
        for (k, &p) in predecessors.iter().enumerate().rev() {
            let position = self.next_layers[p]
                .iter()
                .position(|&n| n == i)
                .ok_or_else(|| NnError::incorrect_parameter(format!("no edge {p} -> {i}")))?;
            self.backward[p].add_input(gradients[k].clone(), position, position)?;
        }
        Ok(())
    }

    /// Runs every forward layer in index order.
    pub fn forward(&mut self) -> Result<(), NnError> {
        self.check_allocated()?;
        for (i, layer) in self.forward.iter_mut().enumerate() {
            layer.compute().map_err(|e| e.in_layer(i))?;
        }
        Ok(())
    }

    /// Runs every backward layer in reverse index order. Layers that need an
    /// incoming gradient and received none are skipped.
    pub fn backward(&mut self) -> Result<(), NnError> {
        self.check_allocated()?;
        if self.mode != ModelMode::Training {
            return Err(NnError::incorrect_parameter("backward pass on a prediction model"));
        }
        for i in (0..self.backward.len()).rev() {
            let layer = &mut self.backward[i];
            if layer.requires_input_gradient() && layer.input().is_empty() {
                continue;
            }
            let context = ForwardContext::capture(self.forward[i].as_ref()).map_err(|e| e.in_layer(i))?;
            layer.set_forward_context(context);
            layer.compute().map_err(|e| e.in_layer(i))?;
        }
        Ok(())
    }

    /// Points the input layer at `data`, which must have the allocated sample dims.
    pub fn set_input(&mut self, data: Tensor) -> Result<(), NnError> {
        let dims = self.check_allocated()?;
        if data.dims() != dims {
            return Err(NnError::size_mismatch("model input", dims, data.dims()));
        }
        self.forward[0].input_mut().replace(0, data).map_err(|e| e.in_layer(0))
    }

    /// Sets the ground truth read by (sink) layer `layer`.
    pub fn set_ground_truth(&mut self, layer: usize, ground_truth: Tensor) -> Result<(), NnError> {
        let count = self.forward.len();
        let target = self
            .forward
            .get_mut(layer)
            .ok_or_else(|| NnError::incorrect_parameter(format!("layer {layer} out of range ({count} layers)")))?;
        target.input_mut().set_ground_truth(ground_truth);
        Ok(())
    }

    fn check_allocated(&self) -> Result<&[usize], NnError> {
        self.sample_dims.as_deref().ok_or(NnError::NullModel)
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn layer_count(&self) -> usize {
        self.forward.len()
    }

    pub fn is_allocated(&self) -> bool {
        self.sample_dims.is_some()
    }

    pub fn sample_dims(&self) -> Option<&[usize]> {
        self.sample_dims.as_deref()
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.sample_dims.as_ref().and_then(|d| d.first().copied())
    }

    pub fn parameter(&self) -> &ModelParameter {
        &self.parameter
    }

    /// Annotations saved with the model; they do not affect computation.
    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn set_metadata(&mut self, metadata: ModelMetadata) {
        self.metadata = metadata;
    }

    pub fn next_layers(&self) -> &[Vec<usize>] {
        &self.next_layers
    }

    /// Predecessors of every layer; filled by `allocate`.
    pub fn backward_next_layers(&self) -> &[Vec<usize>] {
        &self.backward_next_layers
    }

    /// Layers without outgoing edges, ascending.
    pub fn sinks(&self) -> Vec<usize> {
        (0..self.next_layers.len()).filter(|&i| self.next_layers[i].is_empty()).collect()
    }

    pub fn layer(&self, index: usize) -> Option<&dyn Layer> {
        self.prototypes.get(index).map(|l| l.as_ref())
    }

    pub fn forward_layer(&self, index: usize) -> Option<&dyn ForwardLayer> {
        self.forward.get(index).map(|l| l.as_ref())
    }

    pub fn backward_layer(&self, index: usize) -> Option<&dyn BackwardLayer> {
        self.backward.get(index).map(|l| l.as_ref())
    }

    /// Current output of layer `index`.
    pub fn result(&self, index: usize) -> Option<Tensor> {
        self.forward.get(index).and_then(|l| l.result())
    }

    /// Gradient-propagation flag of every layer (training models only).
    pub fn propagate_gradient(&self) -> &[bool] {
        &self.propagate_gradient
    }

    /// Indices of the layers owning at least one weight or bias.
    pub fn learnable_layers(&self) -> Result<Vec<usize>, NnError> {
        Ok(self.weights_and_biases()?.layout().learnable_layers())
    }

    pub fn weights_and_biases(&self) -> Result<&WeightsAndBiases, NnError> {
        self.weights_and_biases.as_ref().ok_or(NnError::NullModel)
    }

    pub fn weights_and_biases_mut(&mut self) -> Result<&mut WeightsAndBiases, NnError> {
        self.weights_and_biases.as_mut().ok_or(NnError::NullModel)
    }

    /// Derivative store written by the backward pass (training models only).
    pub fn derivatives(&self) -> Result<&WeightsAndBiases, NnError> {
        self.derivatives.as_ref().ok_or(NnError::NullModel)
    }

    /// Snapshot of every learnable parameter, independent of the model.
    pub fn get_weights_and_biases(&self) -> Result<Tensor, NnError> {
        Ok(self.weights_and_biases()?.copy_to_table()?.deep_copy())
    }

    pub fn set_weights_and_biases(&mut self, table: &Tensor) -> Result<(), NnError> {
        self.weights_and_biases_mut()?.copy_from_table(table)
    }

    pub fn get_layer_weights_and_biases(&self, layer: usize) -> Result<Tensor, NnError> {
        self.weights_and_biases()?.copy_layer_to_table(layer)
    }

    pub fn set_layer_weights_and_biases(&mut self, layer: usize, table: &Tensor) -> Result<(), NnError> {
        self.weights_and_biases_mut()?.copy_layer_from_table(table, layer)
    }

    /// The topology this model was built from.
    pub fn topology(&self) -> Result<Topology, NnError> {
        let mut topology = Topology::new();
        for layer in &self.prototypes {
            topology.push_back_boxed(layer.clone_layer());
        }
        for (from, next) in self.next_layers.iter().enumerate() {
            for &to in next {
                topology.add_next(from, to)?;
            }
        }
        Ok(topology)
    }

    /// Forward-only copy of this model. Every layer is replaced by its
    /// prediction counterpart (loss sinks become their output activation);
    /// learned parameters are copied when this model is allocated.
    pub fn to_prediction_model(&self) -> Result<Model, NnError> {
        let mut prediction = Model::new(ModelMode::Prediction);
        prediction.metadata = self.metadata.clone();
        for (index, layer) in self.prototypes.iter().enumerate() {
            let descriptor = LayerDescriptor::new(index, layer.prediction_layer(), self.next_layers[index].clone());
            prediction.insert_layer(&descriptor)?;
        }
        if let Some(dims) = &self.sample_dims {
            let parameter = ModelParameter { storage: StoragePreference::Table, seed: self.parameter.seed };
            prediction.allocate(dims, &parameter)?;
            prediction.set_weights_and_biases(&self.get_weights_and_biases()?)?;
        }
        Ok(prediction)
    }
}

fn build_weights_and_biases(
    forward: &mut [Box<dyn ForwardLayer>],
    layout: ParameterLayout,
    kind: StorageKind,
    seed: u64,
) -> Result<WeightsAndBiases, NnError> {
    let mut rng = StdRng::seed_from_u64(seed);
    match kind {
        StorageKind::Tensors => {
            let mut weights = Vec::with_capacity(forward.len());
            let mut biases = Vec::with_capacity(forward.len());
            for (i, layer) in forward.iter_mut().enumerate() {
                if layout.layer_size(i) == 0 {
                    weights.push(None);
                    biases.push(None);
                    continue;
                }
                if layer.parameter().weights_and_biases_initialized {
                    weights.push(layer.weights());
                    biases.push(layer.biases());
                    continue;
                }
                let w = layout.weight_dims(i).map(Tensor::zeros).transpose()?;
                let b = layout.bias_dims(i).map(Tensor::zeros).transpose()?;
                initialize_parameters(layer.parameter(), w.as_ref(), b.as_ref(), fan_in(&layout, i), &mut rng);
                layer.set_weights_and_biases(w.clone(), b.clone());
                weights.push(w);
                biases.push(b);
            }
            Ok(WeightsAndBiases::Tensors(TensorBacked::new(layout, weights, biases)?))
        }
        StorageKind::Table => {
            let table = TableBacked::new(layout)?;
            for (i, layer) in forward.iter_mut().enumerate() {
                if table.layout().layer_size(i) == 0 {
                    continue;
                }
                let w = table.weights_view(i)?;
                let b = table.biases_view(i)?;
                if layer.parameter().weights_and_biases_initialized {
                    copy_into(layer.weights(), w.as_ref(), "weights", i)?;
                    copy_into(layer.biases(), b.as_ref(), "biases", i)?;
                    layer.parameter_mut().weights_and_biases_initialized = false;
                } else {
                    let fan_in = fan_in(table.layout(), i);
                    initialize_parameters(layer.parameter(), w.as_ref(), b.as_ref(), fan_in, &mut rng);
                }
                layer.set_weights_and_biases(w, b);
            }
            Ok(WeightsAndBiases::Table(table))
        }
    }
}

fn fan_in(layout: &ParameterLayout, layer: usize) -> usize {
    layout.weight_dims(layer).and_then(|d| d.first().copied()).unwrap_or(1)
}

fn initialize_parameters(
    parameter: &LayerParameter,
    weights: Option<&Tensor>,
    biases: Option<&Tensor>,
    fan_in: usize,
    rng: &mut StdRng,
) {
    if let Some(w) = weights {
        parameter.weights_initializer.fill(w, fan_in, rng);
    }
    if let Some(b) = biases {
        parameter.biases_initializer.fill(b, fan_in, rng);
    }
}

fn copy_into(source: Option<Tensor>, target: Option<&Tensor>, what: &str, layer: usize) -> Result<(), NnError> {
    match (source, target) {
        (Some(source), Some(target)) => target.assign(&source).map_err(|e| e.in_layer(layer)),
        (None, None) => Ok(()),
        _ => Err(NnError::NullTensor(format!("{what} of layer {layer}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{ActivationFunction, ActivationLayer, ConcatLayer, DenseLayer, LossLayer};

    fn chain() -> Topology {
        let mut topology = Topology::new();
        topology.push_back(ActivationLayer::identity());
        topology.push_back(DenseLayer::new(3));
        topology.push_back(ActivationLayer::new(ActivationFunction::Tanh));
        topology.push_back(DenseLayer::new(2));
        topology.push_back(LossLayer::mse());
        for i in 0..4 {
            topology.add_next(i, i + 1).unwrap();
        }
        topology
    }

    #[test]
    fn test_allocate_lays_out_parameters() {
        let mut model = Model::from_topology(&chain(), ModelMode::Training).unwrap();
        model.allocate(&[4, 5], &ModelParameter::default()).unwrap();

        assert_eq!(model.learnable_layers().unwrap(), vec![1, 3]);
        let layout = model.weights_and_biases().unwrap().layout();
        assert_eq!(layout.total_size(), 5 * 3 + 3 + 3 * 2 + 2);
        assert_eq!(model.weights_and_biases().unwrap().kind(), StorageKind::Table);
        assert_eq!(model.propagate_gradient(), &[false, true, true, true, true]);
        assert_eq!(model.sinks(), vec![4]);
        assert_eq!(model.batch_size(), Some(4));
    }

    #[test]
    fn test_forward_before_allocate_fails() {
        let mut model = Model::from_topology(&chain(), ModelMode::Prediction).unwrap();
        assert!(matches!(model.forward(), Err(NnError::NullModel)));
        assert!(matches!(Model::new(ModelMode::Training).allocate(&[1, 1], &ModelParameter::default()), Err(NnError::NullModel)));
    }

    #[test]
    fn test_insert_out_of_order() {
        let mut model = Model::new(ModelMode::Prediction);
        let descriptor = LayerDescriptor::new(1, Box::new(ActivationLayer::identity()), Vec::new());
        assert!(model.insert_layer(&descriptor).is_err());
    }

    #[test]
    fn test_fan_out_marks_consumers_shared() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let mut topology = Topology::new();
        topology.push_back(ActivationLayer::identity());
        topology.push_back(ActivationLayer::identity().with_inplace_computation(true));
        topology.push_back(DenseLayer::new(2));
        topology.push_back(ConcatLayer::new());
        topology.add_next(0, 1).unwrap();
        topology.add_next(0, 2).unwrap();
        topology.add_next(1, 3).unwrap();
        topology.add_next(2, 3).unwrap();

        let mut model = Model::from_topology(&topology, ModelMode::Prediction).unwrap();
        model.allocate(&[1, 2], &ModelParameter::default()).unwrap();
        let consumer = model.forward_layer(1).unwrap();
        assert!(consumer.input().is_shared(0));
        assert!(!model.forward_layer(3).unwrap().input().is_shared(0));
        // in-place was requested but the input is shared
        assert!(!model.result(1).unwrap().shares_storage(&model.result(0).unwrap()));
        assert_eq!(model.result(3).unwrap().dims(), &[1, 4]);
    }

    #[test]
    fn test_reallocation_keeps_parameters() {
        let mut model = Model::from_topology(&chain(), ModelMode::Training).unwrap();
        model.allocate(&[2, 5], &ModelParameter::default()).unwrap();
        let before = model.get_weights_and_biases().unwrap();
        model.allocate(&[3, 5], &ModelParameter::default()).unwrap();
        assert_eq!(model.get_weights_and_biases().unwrap(), before);
        assert_eq!(model.batch_size(), Some(3));
    }

    #[test]
    fn test_failed_reallocation_leaves_model_unallocated() {
        let weights = Tensor::from_vec(&[2, 1], vec![0.5, 0.25]).unwrap();
        let biases = Tensor::from_vec(&[1], vec![0.5]).unwrap();
        let mut topology = Topology::new();
        topology.push_back(ActivationLayer::identity());
        topology.push_back(DenseLayer::new(1).with_weights_and_biases(weights, biases));
        topology.add_next(0, 1).unwrap();

        let mut model = Model::from_topology(&topology, ModelMode::Prediction).unwrap();
        model.allocate(&[1, 2], &ModelParameter::default()).unwrap();
        // caller-owned weights only fit two input features
        assert!(model.allocate(&[1, 3], &ModelParameter::default()).is_err());
        assert!(!model.is_allocated());
        assert!(matches!(model.forward(), Err(NnError::NullModel)));

        model.allocate(&[1, 2], &ModelParameter::default()).unwrap();
        assert_eq!(model.get_weights_and_biases().unwrap().to_vec(), vec![0.5, 0.25, 0.5]);
        model.set_input(Tensor::from_vec(&[1, 2], vec![2.0, 4.0]).unwrap()).unwrap();
        model.forward().unwrap();
        assert_eq!(model.result(1).unwrap().to_vec(), vec![2.5]);
    }

    #[test]
    fn test_caller_weights_select_tensor_storage() {
        let w = Tensor::from_vec(&[2, 1], vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(&[1], vec![0.5]).unwrap();
        let mut topology = Topology::new();
        topology.push_back(ActivationLayer::identity());
        topology.push_back(DenseLayer::new(1).with_weights_and_biases(w.clone(), b.clone()));
        topology.add_next(0, 1).unwrap();

        let mut model = Model::from_topology(&topology, ModelMode::Prediction).unwrap();
        model.allocate(&[1, 2], &ModelParameter::default()).unwrap();
        assert_eq!(model.weights_and_biases().unwrap().kind(), StorageKind::Tensors);

        model.set_input(Tensor::from_vec(&[1, 2], vec![1.0, 1.0]).unwrap()).unwrap();
        model.forward().unwrap();
        assert_eq!(model.result(1).unwrap().to_vec(), vec![3.5]);

        // writes land in the caller's tensors
        let table = Tensor::from_vec(&[3], vec![0.0, 0.0, 1.0]).unwrap();
        model.set_weights_and_biases(&table).unwrap();
        assert_eq!(w.to_vec(), vec![0.0, 0.0]);
        assert_eq!(b.to_vec(), vec![1.0]);
    }

    #[test]
    fn test_set_input_checks_dims() {
        let mut model = Model::from_topology(&chain(), ModelMode::Prediction).unwrap();
        model.allocate(&[2, 5], &ModelParameter::default()).unwrap();
        assert!(model.set_input(Tensor::zeros(&[2, 4]).unwrap()).is_err());
        assert!(model.set_input(Tensor::zeros(&[2, 5]).unwrap()).is_ok());
    }

    #[test]
    fn test_prediction_model_replaces_loss() {
        let mut model = Model::from_topology(&chain(), ModelMode::Training).unwrap();
        model.allocate(&[2, 5], &ModelParameter::default()).unwrap();
        let prediction = model.to_prediction_model().unwrap();
        assert_eq!(prediction.mode(), ModelMode::Prediction);
        assert_eq!(prediction.layer(4).unwrap().kind(), "activation");
        assert_eq!(prediction.get_weights_and_biases().unwrap(), model.get_weights_and_biases().unwrap());
    }
}
