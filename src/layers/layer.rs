use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::NnError;
use crate::layers::input::LayerInput;
use crate::math::init::Initializer;
use crate::math::tensor::Tensor;

/// Per-layer switches shared by the forward and backward stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParameter {
    /// Whether the backward stage forwards a gradient to its predecessors.
    /// Derived by the model at allocation time.
    #[serde(skip, default = "default_true")]
    pub propagate_gradient: bool,
    /// Set when the caller supplied the weights and biases. The model then
    /// keeps the caller's tensors instead of packing them into its own buffer.
    #[serde(skip)]
    pub weights_and_biases_initialized: bool,
    /// Lets the layer overwrite its input instead of allocating a result.
    /// Only honoured when the input is not shared.
    #[serde(default)]
    pub allow_inplace_computation: bool,
    #[serde(default)]
    pub weights_initializer: Initializer,
    #[serde(default = "zeros_initializer")]
    pub biases_initializer: Initializer,
}

fn default_true() -> bool {
    true
}

fn zeros_initializer() -> Initializer {
    Initializer::Zeros
}

impl Default for LayerParameter {
    fn default() -> Self {
        LayerParameter {
            propagate_gradient: true,
            weights_and_biases_initialized: false,
            allow_inplace_computation: false,
            weights_initializer: Initializer::default(),
            biases_initializer: Initializer::Zeros,
        }
    }
}

/// A layer in a topology: a prototype that knows how to create its forward
/// and backward stages.
///
/// The catalog is open: any type implementing this trait can be pushed into
/// a `Topology`. To be persisted in a model archive it also has to be
/// registered in a `LayerRegistry` under its `kind()`.
pub trait Layer: fmt::Debug + Send {
    /// Stable tag used by the layer registry.
    fn kind(&self) -> &'static str;

    /// Configuration written to topology files and model archives.
    fn config(&self) -> Result<serde_json::Value, NnError>;

    fn forward_layer(&self) -> Box<dyn ForwardLayer>;

    fn backward_layer(&self) -> Box<dyn BackwardLayer>;

    /// The layer used in place of this one when a trained model is turned
    /// into a prediction model.
    fn prediction_layer(&self) -> Box<dyn Layer> {
        self.clone_layer()
    }

    fn clone_layer(&self) -> Box<dyn Layer>;
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_layer()
    }
}

/// Forward (inference direction) stage of a layer.
pub trait ForwardLayer: fmt::Debug + Send {
    fn kind(&self) -> &'static str;

    fn parameter(&self) -> &LayerParameter;

    fn parameter_mut(&mut self) -> &mut LayerParameter;

    fn input(&self) -> &LayerInput;

    fn input_mut(&mut self) -> &mut LayerInput;

    /// Wires `tensor` into `input_slot`; data inputs take the next free position.
    fn add_input(&mut self, tensor: Tensor, edge_ordinal: usize, input_slot: usize) -> Result<(), NnError> {
        self.input_mut().add(tensor, edge_ordinal, input_slot)
    }

    /// Allocates a placeholder data input for a layer fed by the caller.
    fn allocate_input(&mut self, dims: &[usize]) -> Result<(), NnError> {
        let placeholder = Tensor::zeros(dims)?;
        let input = self.input_mut();
        input.add(placeholder, 0, crate::layers::input::DATA_SLOT)?;
        let position = input.len() - 1;
        input.mark_shared(position);
        Ok(())
    }

    /// Forgets every wired input before the layer is re-wired.
    fn initialize_input(&mut self) {
        self.input_mut().clear();
    }

    /// Dims of the weights for the currently wired inputs; `None` when the
    /// layer has no weights.
    fn weights_dims(&self) -> Result<Option<Vec<usize>>, NnError> {
        Ok(None)
    }

    fn biases_dims(&self) -> Result<Option<Vec<usize>>, NnError> {
        Ok(None)
    }

    fn weights(&self) -> Option<Tensor> {
        None
    }

    fn biases(&self) -> Option<Tensor> {
        None
    }

    /// Installs the tensors the layer computes with.
    fn set_weights_and_biases(&mut self, _weights: Option<Tensor>, _biases: Option<Tensor>) {}

    fn allocate_result(&mut self) -> Result<(), NnError>;

    fn result(&self) -> Option<Tensor>;

    fn compute(&mut self) -> Result<(), NnError>;

    /// Scalar loss of the last `compute`; only loss layers have one.
    fn loss_value(&self) -> Option<f64> {
        None
    }

    fn clone_layer(&self) -> Box<dyn ForwardLayer>;
}

/// What a backward stage needs from its forward counterpart.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub inputs: Vec<Tensor>,
    pub ground_truth: Option<Tensor>,
    pub value: Tensor,
    pub weights: Option<Tensor>,
    pub biases: Option<Tensor>,
}

impl ForwardContext {
    /// Captures handles to the forward layer's current inputs and result.
    pub fn capture(layer: &dyn ForwardLayer) -> Result<ForwardContext, NnError> {
        let value = layer
            .result()
            .ok_or_else(|| NnError::NullResult(format!("{} forward result", layer.kind())))?;
        Ok(ForwardContext {
            inputs: layer.input().tensors()?,
            ground_truth: layer.input().ground_truth().ok(),
            value,
            weights: layer.weights(),
            biases: layer.biases(),
        })
    }

    pub fn input(&self, position: usize) -> Result<&Tensor, NnError> {
        self.inputs
            .get(position)
            .ok_or_else(|| NnError::NullTensor(format!("forward input {position}")))
    }
}

/// Gradients produced by a backward stage.
#[derive(Debug, Clone, Default)]
pub struct BackwardResult {
    /// Gradient with respect to each forward data input, in input order.
    pub input_gradients: Vec<Tensor>,
    pub weight_derivatives: Option<Tensor>,
    pub bias_derivatives: Option<Tensor>,
}

/// Backward (training direction) stage of a layer.
pub trait BackwardLayer: fmt::Debug + Send {
    fn kind(&self) -> &'static str;

    fn parameter(&self) -> &LayerParameter;

    fn parameter_mut(&mut self) -> &mut LayerParameter;

    /// Incoming gradients, one position per outgoing forward edge.
    fn input(&self) -> &LayerInput;

    fn input_mut(&mut self) -> &mut LayerInput;

    /// Places `tensor` at gradient position `input_slot`.
    fn add_input(&mut self, tensor: Tensor, edge_ordinal: usize, input_slot: usize) -> Result<(), NnError> {
        self.input_mut().set_at(input_slot, tensor, edge_ordinal);
        Ok(())
    }

    /// Loss layers derive their gradient from the ground truth and need none.
    fn requires_input_gradient(&self) -> bool {
        true
    }

    fn set_forward_context(&mut self, context: ForwardContext);

    /// Installs the tensors the derivatives are written to. Layers left
    /// without them allocate their own in `allocate_result`.
    fn set_derivatives(&mut self, _weights: Option<Tensor>, _biases: Option<Tensor>) {}

    fn allocate_result(&mut self) -> Result<(), NnError>;

    fn result(&self) -> Option<&BackwardResult>;

    fn compute(&mut self) -> Result<(), NnError>;

    fn clone_layer(&self) -> Box<dyn BackwardLayer>;
}
