use serde::{Deserialize, Serialize};

use crate::errors::NnError;
use crate::layers::input::LayerInput;
use crate::layers::layer::{
    BackwardLayer, BackwardResult, ForwardContext, ForwardLayer, Layer, LayerParameter,
};
use crate::math::tensor::Tensor;

/// Joins several inputs along the feature axis: `[batch, f_0 + f_1 + ...]`.
///
/// Inputs are laid out in wiring order, i.e. by ascending producer index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcatLayer {
    #[serde(default)]
    pub parameter: LayerParameter,
}

impl ConcatLayer {
    pub fn new() -> ConcatLayer {
        ConcatLayer::default()
    }
}

impl Layer for ConcatLayer {
    fn kind(&self) -> &'static str {
        "concat"
    }

    fn config(&self) -> Result<serde_json::Value, NnError> {
        Ok(serde_json::to_value(self)?)
    }

    fn forward_layer(&self) -> Box<dyn ForwardLayer> {
        Box::new(ConcatForward {
            parameter: self.parameter.clone(),
            input: LayerInput::new(),
            value: None,
        })
    }

    fn backward_layer(&self) -> Box<dyn BackwardLayer> {
        Box::new(ConcatBackward {
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

fn check_rows(inputs: &[Tensor]) -> Result<usize, NnError> {
    let first = inputs.first().ok_or_else(|| NnError::NullTensor("concat input 0".into()))?;
    let rows = first.leading_dim();
    if let Some(bad) = inputs.iter().find(|t| t.leading_dim() != rows) {
        return Err(NnError::size_mismatch("concat input rows", &[rows], &[bad.leading_dim()]));
    }
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct ConcatForward {
    parameter: LayerParameter,
    input: LayerInput,
    value: Option<Tensor>,
}

impl ForwardLayer for ConcatForward {
    fn kind(&self) -> &'static str {
        "concat"
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
        let inputs = self.input.tensors()?;
        let rows = check_rows(&inputs)?;
        let width = inputs.iter().map(Tensor::row_len).sum::<usize>();
        self.value = Some(Tensor::zeros(&[rows, width])?);
        Ok(())
    }

    fn result(&self) -> Option<Tensor> {
        self.value.clone()
    }

    fn compute(&mut self) -> Result<(), NnError> {
        let inputs = self.input.tensors()?;
        let rows = check_rows(&inputs)?;
        let value = self.value.as_ref().ok_or_else(|| NnError::NullResult("concat value".into()))?;
        let width = value.row_len();
        let mut out = value.data_mut();
        let mut column = 0;
        for x in &inputs {
            let (xd, len) = (x.data(), x.row_len());
            if column + len > width {
                return Err(NnError::size_mismatch("concat value", &[rows, column + len], value.dims()));
            }
            for r in 0..rows {
                out[r * width + column..r * width + column + len]
                    .copy_from_slice(&xd[r * len..(r + 1) * len]);
            }
            column += len;
        }
        Ok(())
    }

    fn clone_layer(&self) -> Box<dyn ForwardLayer> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ConcatBackward {
    parameter: LayerParameter,
    input: LayerInput,
    context: Option<ForwardContext>,
    result: Option<BackwardResult>,
}

impl BackwardLayer for ConcatBackward {
    fn kind(&self) -> &'static str {
        "concat"
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
        let context = self.context.as_ref().ok_or_else(|| NnError::NullTensor("concat forward context".into()))?;
        let input_gradients = context
            .inputs
            .iter()
            .map(|x| Tensor::zeros(x.dims()))
            .collect::<Result<Vec<_>, _>>()?;
        self.result = Some(BackwardResult { input_gradients, ..BackwardResult::default() });
        Ok(())
    }

    fn result(&self) -> Option<&BackwardResult> {
        self.result.as_ref()
    }

    fn compute(&mut self) -> Result<(), NnError> {
        if !self.parameter.propagate_gradient {
            return Ok(());
        }
        let result = self.result.as_ref().ok_or_else(|| NnError::NullResult("concat gradient".into()))?;
        let g = self.input.summed()?;
        let (rows, width) = (g.leading_dim(), g.row_len());
        let gd = g.data();
        let mut column = 0;
        for dx in &result.input_gradients {
            let len = dx.row_len();
            if column + len > width || dx.leading_dim() != rows {
                return Err(NnError::size_mismatch("concat input gradient", &[rows, width], dx.dims()));
            }
            let mut out = dx.data_mut();
            for r in 0..rows {
                out[r * len..(r + 1) * len]
                    .copy_from_slice(&gd[r * width + column..r * width + column + len]);
            }
            column += len;
        }
        Ok(())
    }

    fn clone_layer(&self) -> Box<dyn BackwardLayer> {
        Box::new(self.clone())
    }
}
