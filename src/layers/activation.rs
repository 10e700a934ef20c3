use serde::{Deserialize, Serialize};
use std::f64::consts::{E, PI};

use crate::errors::NnError;
use crate::layers::input::LayerInput;
use crate::layers::layer::{
    BackwardLayer, BackwardResult, ForwardContext, ForwardLayer, Layer, LayerParameter,
};
use crate::math::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFunction {
    Sigmoid,
    ReLU,
    Identity,
    /// Row-wise softmax over the features of each sample.
    Softmax,
    Tanh,
    LeakyReLU { alpha: f64 },
    Elu { alpha: f64 },
    Gelu,
    Swish,
}

impl ActivationFunction {
    /// Element-wise activation. Softmax is not element-wise and is handled
    /// per row by `apply`.
    fn function(&self, x: f64) -> f64 {
        match *self {
            ActivationFunction::Sigmoid => 1.0 / (1.0 + E.powf(-x)),
            ActivationFunction::ReLU => x.max(0.0),
            ActivationFunction::Identity | ActivationFunction::Softmax => x,
            ActivationFunction::Tanh => x.tanh(),
            ActivationFunction::LeakyReLU { alpha } => if x > 0.0 { x } else { alpha * x },
            ActivationFunction::Elu { alpha } => if x > 0.0 { x } else { alpha * (E.powf(x) - 1.0) },
            ActivationFunction::Gelu => {
                let c = (2.0_f64 / PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh())
            }
            ActivationFunction::Swish => x / (1.0 + E.powf(-x)),
        }
    }

    /// Element-wise derivative at pre-activation `x`.
    fn derivative(&self, x: f64) -> f64 {
        match *self {
            ActivationFunction::Sigmoid => {
                let fx = self.function(x);
                fx * (1.0 - fx)
            }
            ActivationFunction::ReLU => if x > 0.0 { 1.0 } else { 0.0 },
            ActivationFunction::Identity | ActivationFunction::Softmax => 1.0,
            ActivationFunction::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            ActivationFunction::LeakyReLU { alpha } => if x > 0.0 { 1.0 } else { alpha },
            ActivationFunction::Elu { alpha } => if x > 0.0 { 1.0 } else { alpha * E.powf(x) },
            ActivationFunction::Gelu => {
                let c = (2.0_f64 / PI).sqrt();
                let inner = c * (x + 0.044715 * x.powi(3));
                let tanh_inner = inner.tanh();
                let sech2 = 1.0 - tanh_inner * tanh_inner;
                let d_inner = c * (1.0 + 3.0 * 0.044715 * x.powi(2));
                0.5 * tanh_inner + 0.5 * x * sech2 * d_inner + 0.5
            }
            ActivationFunction::Swish => {
                let sig = 1.0 / (1.0 + E.powf(-x));
                sig + x * sig * (1.0 - sig)
            }
        }
    }

    /// Applies the activation in place to `values`, a buffer of rows of `row_len`.
    pub fn apply(&self, values: &mut [f64], row_len: usize) {
        match self {
            ActivationFunction::Softmax => {
                for row in values.chunks_mut(row_len.max(1)) {
                    softmax_in_place(row);
                }
            }
            _ => values.iter_mut().for_each(|v| *v = self.function(*v)),
        }
    }
}

/// Numerically stable softmax over one row.
pub(crate) fn softmax_in_place(row: &mut [f64]) {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        row.iter_mut().for_each(|v| *v /= sum);
    }
}

/// Layer applying an activation function; has no weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationLayer {
    pub function: ActivationFunction,
    #[serde(default)]
    pub parameter: LayerParameter,
}

impl ActivationLayer {
    pub fn new(function: ActivationFunction) -> ActivationLayer {
        ActivationLayer { function, parameter: LayerParameter::default() }
    }

    /// Pass-through layer, typically the input layer of a graph.
    pub fn identity() -> ActivationLayer {
        ActivationLayer::new(ActivationFunction::Identity)
    }

    pub fn with_inplace_computation(mut self, allow: bool) -> ActivationLayer {
        self.parameter.allow_inplace_computation = allow;
        self
    }
}

impl Layer for ActivationLayer {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn config(&self) -> Result<serde_json::Value, NnError> {
        Ok(serde_json::to_value(self)?)
    }

    fn forward_layer(&self) -> Box<dyn ForwardLayer> {
        Box::new(ActivationForward {
            function: self.function,
            parameter: self.parameter.clone(),
            input: LayerInput::new(),
            value: None,
        })
    }

    fn backward_layer(&self) -> Box<dyn BackwardLayer> {
        Box::new(ActivationBackward {
            function: self.function,
            parameter: self.parameter.clone(),
            input: LayerInput::new(),
            context: None,
            result: None,
        })
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ActivationForward {
    function: ActivationFunction,
    parameter: LayerParameter,
    input: LayerInput,
    value: Option<Tensor>,
}

impl ForwardLayer for ActivationForward {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn parameter(&self) -> &LayerParameter {
        &self.parameter
    }

    fn parameter_mut(&mut self) -> &mut LayerParameter {
        &mut self.parameter
    }

    fn input(&self) -> &LayerInput {
        &self.input
    }

    fn input_mut(&mut self) -> &mut LayerInput {
        &mut self.input
    }

    fn allocate_result(&mut self) -> Result<(), NnError> {
        let x = self.input.get(0)?;
        self.value = if self.parameter.allow_inplace_computation && !self.input.is_shared(0) {
            Some(x)
        } else {
            Some(Tensor::zeros(x.dims())?)
        };
        Ok(())
    }

    fn result(&self) -> Option<Tensor> {
        self.value.clone()
    }

    fn compute(&mut self) -> Result<(), NnError> {
        let x = self.input.get(0)?;
        let value = self.value.as_ref().ok_or_else(|| NnError::NullResult("activation value".into()))?;
        if !value.shares_storage(&x) {
            if value.len() != x.len() {
                return Err(NnError::size_mismatch("activation value", x.dims(), value.dims()));
            }
            value.assign(&x)?;
        }
        self.function.apply(&mut value.data_mut(), x.row_len());
        Ok(())
    }

    fn clone_layer(&self) -> Box<dyn ForwardLayer> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ActivationBackward {
    function: ActivationFunction,
    parameter: LayerParameter,
    input: LayerInput,
    context: Option<ForwardContext>,
    result: Option<BackwardResult>,
}

impl BackwardLayer for ActivationBackward {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn parameter(&self) -> &LayerParameter {
        &self.parameter
    }

    fn parameter_mut(&mut self) -> &mut LayerParameter {
        &mut self.parameter
    }

    fn input(&self) -> &LayerInput {
        &self.input
    }

    fn input_mut(&mut self) -> &mut LayerInput {
        &mut self.input
    }

    fn set_forward_context(&mut self, context: ForwardContext) {
        self.context = Some(context);
    }

    fn allocate_result(&mut self) -> Result<(), NnError> {
        let context = self.context.as_ref().ok_or_else(|| NnError::NullTensor("activation forward context".into()))?;
        let x = context.input(0)?;
        self.result = Some(BackwardResult {
            input_gradients: vec![Tensor::zeros(x.dims())?],
            ..BackwardResult::default()
        });
        Ok(())
    }

    fn result(&self) -> Option<&BackwardResult> {
        self.result.as_ref()
    }

    fn compute(&mut self) -> Result<(), NnError> {
        if !self.parameter.propagate_gradient {
            return Ok(());
        }
        let context = self.context.as_ref().ok_or_else(|| NnError::NullTensor("activation forward context".into()))?;
        let result = self.result.as_ref().ok_or_else(|| NnError::NullResult("activation gradient".into()))?;
        let g = self.input.summed()?;
        let x = context.input(0)?;
        if g.len() != x.len() {
            return Err(NnError::size_mismatch("activation input gradient", x.dims(), g.dims()));
        }

        let gd = g.data();
        let mut dx = result.input_gradients[0].data_mut();
        match self.function {
            ActivationFunction::Softmax => {
                // dx_i = s_i * (g_i - sum_j g_j s_j), per row
                let s = context.value.data();
                let row_len = x.row_len().max(1);
                for ((dx_row, g_row), s_row) in dx
                    .chunks_mut(row_len)
                    .zip(gd.chunks(row_len))
                    .zip(s.chunks(row_len))
                {
                    let dot: f64 = g_row.iter().zip(s_row).map(|(g, s)| g * s).sum();
                    for ((d, g), s) in dx_row.iter_mut().zip(g_row).zip(s_row) {
                        *d = s * (g - dot);
                    }
                }
            }
            function => {
                let xd = x.data();
                for ((d, g), xv) in dx.iter_mut().zip(gd.iter()).zip(xd.iter()) {
                    *d = g * function.derivative(*xv);
                }
            }
        }
        Ok(())
    }

    fn clone_layer(&self) -> Box<dyn BackwardLayer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::input::DATA_SLOT;
    use approx::assert_relative_eq;

    fn forward_on(function: ActivationFunction, values: Vec<f64>) -> Box<dyn ForwardLayer> {
        let n = values.len();
        let mut fwd = ActivationLayer::new(function).forward_layer();
        fwd.add_input(Tensor::from_vec(&[1, n], values).unwrap(), 0, DATA_SLOT).unwrap();
        fwd.allocate_result().unwrap();
        fwd.compute().unwrap();
        fwd
    }

    #[test]
    fn test_relu_forward() {
        let fwd = forward_on(ActivationFunction::ReLU, vec![-1.0, 0.5, 2.0]);
        assert_eq!(fwd.result().unwrap().to_vec(), vec![0.0, 0.5, 2.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let fwd = forward_on(ActivationFunction::Softmax, vec![1.0, 2.0, 3.0]);
        let s: f64 = fwd.result().unwrap().to_vec().iter().sum();
        assert_relative_eq!(s, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sigmoid_backward_matches_finite_difference() {
        let x0 = 0.3;
        let fwd = forward_on(ActivationFunction::Sigmoid, vec![x0]);
        let mut bwd = ActivationLayer::new(ActivationFunction::Sigmoid).backward_layer();
        bwd.set_forward_context(ForwardContext::capture(fwd.as_ref()).unwrap());
        bwd.allocate_result().unwrap();
        bwd.add_input(Tensor::from_vec(&[1, 1], vec![1.0]).unwrap(), 0, 0).unwrap();
        bwd.compute().unwrap();

        let h = 1e-6;
        let f = |x: f64| 1.0 / (1.0 + (-x).exp());
        let numeric = (f(x0 + h) - f(x0 - h)) / (2.0 * h);
        let analytic = bwd.result().unwrap().input_gradients[0].to_vec()[0];
        assert_relative_eq!(analytic, numeric, epsilon = 1e-6);
    }

    #[test]
    fn test_inplace_only_when_input_not_shared() {
        let layer = ActivationLayer::new(ActivationFunction::ReLU).with_inplace_computation(true);

        let mut own = layer.forward_layer();
        own.add_input(Tensor::zeros(&[1, 2]).unwrap(), 0, DATA_SLOT).unwrap();
        own.allocate_result().unwrap();
        assert!(own.result().unwrap().shares_storage(&own.input().get(0).unwrap()));

        let mut shared = layer.forward_layer();
        shared.add_input(Tensor::zeros(&[1, 2]).unwrap(), 0, DATA_SLOT).unwrap();
        shared.input_mut().mark_shared(0);
        shared.allocate_result().unwrap();
        assert!(!shared.result().unwrap().shares_storage(&shared.input().get(0).unwrap()));
    }

    #[test]
    fn test_inplace_compute_overwrites_input() {
        let mut fwd = ActivationLayer::new(ActivationFunction::ReLU)
            .with_inplace_computation(true)
            .forward_layer();
        let x = Tensor::from_vec(&[1, 2], vec![-3.0, 3.0]).unwrap();
        fwd.add_input(x.clone(), 0, DATA_SLOT).unwrap();
        fwd.allocate_result().unwrap();
        fwd.compute().unwrap();
        assert_eq!(x.to_vec(), vec![0.0, 3.0]);
    }
}
