use serde::{Deserialize, Serialize};

use crate::errors::NnError;
use crate::layers::activation::{softmax_in_place, ActivationFunction, ActivationLayer};
use crate::layers::input::LayerInput;
use crate::layers::layer::{
    BackwardLayer, BackwardResult, ForwardContext, ForwardLayer, Layer, LayerParameter,
};
use crate::math::tensor::Tensor;

/// Small epsilon added inside log() to prevent log(0) = -inf.
const EPS: f64 = 1e-12;

/// Selects the loss a `LossLayer` computes.
///
/// - `Mse`:           mean of squared errors over every element of the batch.
/// - `CrossEntropy`:  softmax over each sample's logits followed by
///   categorical cross-entropy, averaged over the batch. The gradient is the
///   combined softmax + cross-entropy one: `(softmax - expected) / batch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    Mse,
    CrossEntropy,
}

impl LossType {
    fn loss(&self, predicted: &[f64], expected: &[f64], row_len: usize) -> f64 {
        let rows = (predicted.len() / row_len.max(1)).max(1) as f64;
        match self {
            LossType::Mse => {
                let n = predicted.len().max(1) as f64;
                predicted.iter().zip(expected).map(|(p, e)| (p - e).powi(2)).sum::<f64>() / n
            }
            LossType::CrossEntropy => {
                let mut total = 0.0;
                for (logits, target) in predicted.chunks(row_len.max(1)).zip(expected.chunks(row_len.max(1))) {
                    let mut probs = logits.to_vec();
                    softmax_in_place(&mut probs);
                    total -= probs.iter().zip(target).map(|(p, e)| e * (p + EPS).ln()).sum::<f64>();
                }
                total / rows
            }
        }
    }

    fn derivative(&self, predicted: &[f64], expected: &[f64], row_len: usize, out: &mut [f64]) {
        match self {
            LossType::Mse => {
                let n = predicted.len().max(1) as f64;
                for ((o, p), e) in out.iter_mut().zip(predicted).zip(expected) {
                    *o = 2.0 * (p - e) / n;
                }
            }
            LossType::CrossEntropy => {
                let rows = (predicted.len() / row_len.max(1)).max(1) as f64;
                for ((o_row, logits), target) in out
                    .chunks_mut(row_len.max(1))
                    .zip(predicted.chunks(row_len.max(1)))
                    .zip(expected.chunks(row_len.max(1)))
                {
                    o_row.copy_from_slice(logits);
                    softmax_in_place(o_row);
                    for (o, e) in o_row.iter_mut().zip(target) {
                        *o = (*o - e) / rows;
                    }
                }
            }
        }
    }
}

/// Sink layer comparing its data input with the ground truth wired on
/// `GROUND_TRUTH_SLOT`. Its forward value is the scalar loss `[1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossLayer {
    pub loss: LossType,
    #[serde(default)]
    pub parameter: LayerParameter,
}

impl LossLayer {
    pub fn new(loss: LossType) -> LossLayer {
        LossLayer { loss, parameter: LayerParameter::default() }
    }

    pub fn mse() -> LossLayer {
        LossLayer::new(LossType::Mse)
    }

    pub fn cross_entropy() -> LossLayer {
        LossLayer::new(LossType::CrossEntropy)
    }
}

impl Layer for LossLayer {
    fn kind(&self) -> &'static str {
        "loss"
    }

    fn config(&self) -> Result<serde_json::Value, NnError> {
        Ok(serde_json::to_value(self)?)
    }

    fn forward_layer(&self) -> Box<dyn ForwardLayer> {
        Box::new(LossForward {
            loss: self.loss,
            parameter: self.parameter.clone(),
            input: LayerInput::new(),
            value: None,
        })
    }

    fn backward_layer(&self) -> Box<dyn BackwardLayer> {
        Box::new(LossBackward {
            loss: self.loss,
            parameter: self.parameter.clone(),
            input: LayerInput::new(),
            context: None,
            result: None,
        })
    }

    /// At prediction time the loss is replaced by the output transform it wraps.
    fn prediction_layer(&self) -> Box<dyn Layer> {
        let function = match self.loss {
            LossType::Mse => ActivationFunction::Identity,
            LossType::CrossEntropy => ActivationFunction::Softmax,
        };
        Box::new(ActivationLayer::new(function))
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

fn check_ground_truth(predicted: &Tensor, expected: &Tensor) -> Result<(), NnError> {
    if predicted.len() != expected.len() {
        return Err(NnError::size_mismatch("ground truth", predicted.dims(), expected.dims()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LossForward {
    loss: LossType,
    parameter: LayerParameter,
    input: LayerInput,
    value: Option<Tensor>,
}

impl ForwardLayer for LossForward {
    fn kind(&self) -> &'static str {
        "loss"
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
        self.input.get(0)?;
        self.value = Some(Tensor::zeros(&[1])?);
        Ok(())
    }

    fn result(&self) -> Option<Tensor> {
        self.value.clone()
    }

    fn compute(&mut self) -> Result<(), NnError> {
        let predicted = self.input.get(0)?;
        let expected = self.input.ground_truth()?;
        check_ground_truth(&predicted, &expected)?;
        let value = self.value.as_ref().ok_or_else(|| NnError::NullResult("loss value".into()))?;
        let loss = self.loss.loss(&predicted.data(), &expected.data(), predicted.row_len());
        value.data_mut()[0] = loss;
        Ok(())
    }

    fn loss_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(|v| v.data().first().copied())
    }

    fn clone_layer(&self) -> Box<dyn ForwardLayer> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct LossBackward {
    loss: LossType,
    parameter: LayerParameter,
    input: LayerInput,
    context: Option<ForwardContext>,
    result: Option<BackwardResult>,
}

impl BackwardLayer for LossBackward {
    fn kind(&self) -> &'static str {
        "loss"
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

    fn requires_input_gradient(&self) -> bool {
        false
    }

    fn set_forward_context(&mut self, context: ForwardContext) {
        self.context = Some(context);
    }

    fn allocate_result(&mut self) -> Result<(), NnError> {
        let context = self.context.as_ref().ok_or_else(|| NnError::NullTensor("loss forward context".into()))?;
        let predicted = context.input(0)?;
        self.result = Some(BackwardResult {
            input_gradients: vec![Tensor::zeros(predicted.dims())?],
            ..BackwardResult::default()
        });
        Ok(())
    }

    fn result(&self) -> Option<&BackwardResult> {
        self.result.as_ref()
    }

    fn compute(&mut self) -> Result<(), NnError> {
        let context = self.context.as_ref().ok_or_else(|| NnError::NullTensor("loss forward context".into()))?;
        let result = self.result.as_ref().ok_or_else(|| NnError::NullResult("loss gradient".into()))?;
        let predicted = context.input(0)?;
        let expected = context
            .ground_truth
            .as_ref()
            .ok_or_else(|| NnError::NullTensor("ground truth".into()))?;
        check_ground_truth(predicted, expected)?;
        self.loss.derivative(
            &predicted.data(),
            &expected.data(),
            predicted.row_len(),
            &mut result.input_gradients[0].data_mut(),
        );
        Ok(())
    }

    fn clone_layer(&self) -> Box<dyn BackwardLayer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::input::{DATA_SLOT, GROUND_TRUTH_SLOT};
    use approx::assert_relative_eq;

    fn loss_forward(loss: LossType, predicted: Tensor, expected: Tensor) -> Box<dyn ForwardLayer> {
        let mut fwd = LossLayer::new(loss).forward_layer();
        fwd.add_input(predicted, 0, DATA_SLOT).unwrap();
        fwd.add_input(expected, 0, GROUND_TRUTH_SLOT).unwrap();
        fwd.allocate_result().unwrap();
        fwd.compute().unwrap();
        fwd
    }

    #[test]
    fn test_mse_value_and_gradient() {
        let p = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let y = Tensor::from_rows(&[vec![1.0, 0.0], vec![3.0, 2.0]]).unwrap();
        let fwd = loss_forward(LossType::Mse, p, y);
        assert_relative_eq!(fwd.result().unwrap().to_vec()[0], 2.0);
        assert_eq!(fwd.loss_value(), Some(2.0));

        let mut bwd = LossLayer::mse().backward_layer();
        assert!(!bwd.requires_input_gradient());
        bwd.set_forward_context(ForwardContext::capture(fwd.as_ref()).unwrap());
        bwd.allocate_result().unwrap();
        bwd.compute().unwrap();
        assert_eq!(bwd.result().unwrap().input_gradients[0].to_vec(), vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_cross_entropy_gradient_is_softmax_minus_target() {
        let p = Tensor::from_rows(&[vec![0.0, 0.0]]).unwrap();
        let y = Tensor::from_rows(&[vec![1.0, 0.0]]).unwrap();
        let fwd = loss_forward(LossType::CrossEntropy, p, y);
        assert_relative_eq!(fwd.result().unwrap().to_vec()[0], 2.0_f64.ln(), epsilon = 1e-9);

        let mut bwd = LossLayer::cross_entropy().backward_layer();
        bwd.set_forward_context(ForwardContext::capture(fwd.as_ref()).unwrap());
        bwd.allocate_result().unwrap();
        bwd.compute().unwrap();
        let g = bwd.result().unwrap().input_gradients[0].to_vec();
        assert_relative_eq!(g[0], -0.5, epsilon = 1e-12);
        assert_relative_eq!(g[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_ground_truth() {
        let mut fwd = LossLayer::mse().forward_layer();
        fwd.add_input(Tensor::zeros(&[1, 1]).unwrap(), 0, DATA_SLOT).unwrap();
        fwd.allocate_result().unwrap();
        assert!(matches!(fwd.compute(), Err(NnError::NullTensor(_))));
    }

    #[test]
    fn test_prediction_counterpart() {
        assert_eq!(LossLayer::cross_entropy().prediction_layer().kind(), "activation");
    }
}
