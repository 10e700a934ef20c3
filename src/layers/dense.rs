use serde::{Deserialize, Serialize};

use crate::errors::NnError;
use crate::layers::input::LayerInput;
use crate::layers::layer::{
    BackwardLayer, BackwardResult, ForwardContext, ForwardLayer, Layer, LayerParameter,
};
use crate::math::tensor::Tensor;

/// Fully connected layer: `y = x · W + b`.
///
/// Each sample is flattened to `in` features. Weights have dims `[in, out]`,
/// biases `[out]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub outputs: usize,
    #[serde(default)]
    pub parameter: LayerParameter,
    /// Caller-owned weights and biases, if supplied.
    #[serde(skip)]
    initial: Option<(Tensor, Tensor)>,
}

impl DenseLayer {
    pub fn new(outputs: usize) -> DenseLayer {
        DenseLayer { outputs, parameter: LayerParameter::default(), initial: None }
    }

    pub fn with_parameter(mut self, parameter: LayerParameter) -> DenseLayer {
        self.parameter = parameter;
        self
    }

    /// Uses caller-provided tensors instead of letting the model allocate them.
    /// The tensors are shared, not copied: training updates them in place.
    pub fn with_weights_and_biases(mut self, weights: Tensor, biases: Tensor) -> DenseLayer {
        self.initial = Some((weights, biases));
        self
    }
}

impl Layer for DenseLayer {
    fn kind(&self) -> &'static str {
        "dense"
    }

    fn config(&self) -> Result<serde_json::Value, NnError> {
        Ok(serde_json::to_value(self)?)
    }

    fn forward_layer(&self) -> Box<dyn ForwardLayer> {
        let mut parameter = self.parameter.clone();
        parameter.weights_and_biases_initialized = self.initial.is_some();
        Box::new(DenseForward {
            outputs: self.outputs,
            parameter,
            input: LayerInput::new(),
            weights: self.initial.as_ref().map(|(w, _)| w.clone()),
            biases: self.initial.as_ref().map(|(_, b)| b.clone()),
            value: None,
        })
    }

    fn backward_layer(&self) -> Box<dyn BackwardLayer> {
        Box::new(DenseBackward {
            parameter: self.parameter.clone(),
            input: LayerInput::new(),
            context: None,
            derivatives: None,
            result: None,
        })
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct DenseForward {
    outputs: usize,
    parameter: LayerParameter,
    input: LayerInput,
    weights: Option<Tensor>,
    biases: Option<Tensor>,
    value: Option<Tensor>,
}

impl ForwardLayer for DenseForward {
    fn kind(&self) -> &'static str {
        "dense"
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

    fn weights_dims(&self) -> Result<Option<Vec<usize>>, NnError> {
        let x = self.input.get(0)?;
        Ok(Some(vec![x.row_len(), self.outputs]))
    }

    fn biases_dims(&self) -> Result<Option<Vec<usize>>, NnError> {
        Ok(Some(vec![self.outputs]))
    }

    fn weights(&self) -> Option<Tensor> {
        self.weights.clone()
    }

    fn biases(&self) -> Option<Tensor> {
        self.biases.clone()
    }

    fn set_weights_and_biases(&mut self, weights: Option<Tensor>, biases: Option<Tensor>) {
        self.weights = weights;
        self.biases = biases;
    }

    fn allocate_result(&mut self) -> Result<(), NnError> {
        let x = self.input.get(0)?;
        self.value = Some(Tensor::zeros(&[x.leading_dim(), self.outputs])?);
        Ok(())
    }

    fn result(&self) -> Option<Tensor> {
        self.value.clone()
    }

    fn compute(&mut self) -> Result<(), NnError> {
        let x = self.input.get(0)?;
        let w = self.weights.as_ref().ok_or_else(|| NnError::NullTensor("dense weights".into()))?;
        let b = self.biases.as_ref().ok_or_else(|| NnError::NullTensor("dense biases".into()))?;
        let value = self.value.as_ref().ok_or_else(|| NnError::NullResult("dense value".into()))?;

        let (rows, inputs, outputs) = (x.leading_dim(), x.row_len(), self.outputs);
        if w.dims() != [inputs, outputs] {
            return Err(NnError::size_mismatch("dense weights", &[inputs, outputs], w.dims()));
        }
        if value.leading_dim() != rows {
            return Err(NnError::size_mismatch("dense value", &[rows, outputs], value.dims()));
        }

        let (xd, wd, bd) = (x.data(), w.data(), b.data());
        let mut y = value.data_mut();
        for r in 0..rows {
            let xr = &xd[r * inputs..(r + 1) * inputs];
            let yr = &mut y[r * outputs..(r + 1) * outputs];
            yr.copy_from_slice(&bd[..outputs]);
            for (k, &xk) in xr.iter().enumerate() {
                let wk = &wd[k * outputs..(k + 1) * outputs];
                for (yo, &wo) in yr.iter_mut().zip(wk) {
                    *yo += xk * wo;
                }
            }
        }
        Ok(())
    }

    fn clone_layer(&self) -> Box<dyn ForwardLayer> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct DenseBackward {
    parameter: LayerParameter,
    input: LayerInput,
    context: Option<ForwardContext>,
    derivatives: Option<(Option<Tensor>, Option<Tensor>)>,
    result: Option<BackwardResult>,
}

impl BackwardLayer for DenseBackward {
    fn kind(&self) -> &'static str {
        "dense"
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

    fn set_derivatives(&mut self, weights: Option<Tensor>, biases: Option<Tensor>) {
        self.derivatives = Some((weights, biases));
    }

    fn allocate_result(&mut self) -> Result<(), NnError> {
        let context = self.context.as_ref().ok_or_else(|| NnError::NullTensor("dense forward context".into()))?;
        let x = context.input(0)?;
        let outputs = context.value.row_len();
        let (wd, bd) = match self.derivatives.clone() {
            Some((Some(w), Some(b))) => (w, b),
            _ => (Tensor::zeros(&[x.row_len(), outputs])?, Tensor::zeros(&[outputs])?),
        };
        self.result = Some(BackwardResult {
            input_gradients: vec![Tensor::zeros(x.dims())?],
            weight_derivatives: Some(wd),
            bias_derivatives: Some(bd),
        });
        Ok(())
    }

    fn result(&self) -> Option<&BackwardResult> {
        self.result.as_ref()
    }

    fn compute(&mut self) -> Result<(), NnError> {
        let context = self.context.as_ref().ok_or_else(|| NnError::NullTensor("dense forward context".into()))?;
        let result = self.result.as_ref().ok_or_else(|| NnError::NullResult("dense gradient".into()))?;
        let g = self.input.summed()?;
        let x = context.input(0)?;
        let w = context.weights.as_ref().ok_or_else(|| NnError::NullTensor("dense weights".into()))?;
        let (rows, inputs, outputs) = (x.leading_dim(), x.row_len(), g.row_len());
        if g.leading_dim() != rows || w.len() != inputs * outputs {
            return Err(NnError::size_mismatch("dense input gradient", &[rows, outputs], g.dims()));
        }

        let gd = g.data();
        if let Some(wd) = &result.weight_derivatives {
            let xd = x.data();
            let mut dw = wd.data_mut();
            dw.iter_mut().for_each(|v| *v = 0.0);
            for r in 0..rows {
                for k in 0..inputs {
                    let xk = xd[r * inputs + k];
                    for o in 0..outputs {
                        dw[k * outputs + o] += xk * gd[r * outputs + o];
                    }
                }
            }
        }
        // Weight and bias derivatives may be views of one buffer: borrow one at a time.
        if let Some(bd) = &result.bias_derivatives {
            let mut db = bd.data_mut();
            db.iter_mut().for_each(|v| *v = 0.0);
            for r in 0..rows {
                for o in 0..outputs {
                    db[o] += gd[r * outputs + o];
                }
            }
        }

        if self.parameter.propagate_gradient {
            let wv = w.data();
            let mut dx = result.input_gradients[0].data_mut();
            for r in 0..rows {
                for k in 0..inputs {
                    dx[r * inputs + k] = (0..outputs)
                        .map(|o| gd[r * outputs + o] * wv[k * outputs + o])
                        .sum();
                }
            }
        }
        Ok(())
    }

    fn clone_layer(&self) -> Box<dyn BackwardLayer> {
        Box::new(self.clone())
    }
}
