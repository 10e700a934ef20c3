use crate::errors::NnError;
use crate::math::tensor::Tensor;
use crate::optim::solver::{IterativeSolver, ObjectiveFunction, SolverInput, SolverParameter, SolverResult};

/// Stochastic gradient descent with optional momentum.
///
/// Each iteration computes `v = momentum * v - learning_rate * grad` and
/// `x = x + v`. Without momentum this is the plain `x -= learning_rate * grad`
/// step. The velocity `v` is the resumable state: it is read from
/// `optional_argument` and handed back as `optional_result`.
#[derive(Debug, Clone)]
pub struct Sgd {
    parameter: SolverParameter,
    pub learning_rate: f64,
    pub momentum: f64,
}

impl Sgd {
    pub fn new(function: Box<dyn ObjectiveFunction>, learning_rate: f64) -> Sgd {
        Sgd { parameter: SolverParameter::new(function), learning_rate, momentum: 0.0 }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Sgd {
        self.momentum = momentum;
        self.parameter.optional_result_required = momentum != 0.0;
        self
    }
}

impl IterativeSolver for Sgd {
    fn parameter(&self) -> &SolverParameter {
        &self.parameter
    }

    fn parameter_mut(&mut self) -> &mut SolverParameter {
        &mut self.parameter
    }

    fn compute(&mut self, input: &SolverInput) -> Result<SolverResult, NnError> {
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(NnError::IncorrectParameter(format!("learning rate {} is not positive", self.learning_rate)));
        }
        let argument = input.argument.deep_copy();
        let velocity = match &input.optional_argument {
            Some(state) if state.len() == argument.len() => state.deep_copy(),
            Some(state) => return Err(NnError::size_mismatch("solver state", argument.dims(), state.dims())),
            None => Tensor::zeros(argument.dims())?,
        };

        for _ in 0..self.parameter.n_iterations {
            let gradient = self.parameter.function.gradient(&argument)?;
            let g = gradient.data();
            let mut v = velocity.data_mut();
            let mut x = argument.data_mut();
            for ((xi, vi), gi) in x.iter_mut().zip(v.iter_mut()).zip(g.iter()) {
                *vi = self.momentum * *vi - self.learning_rate * gi;
                *xi += *vi;
            }
        }

        Ok(SolverResult {
            minimum: argument,
            optional_result: self.parameter.optional_result_required.then_some(velocity),
            n_iterations: self.parameter.n_iterations,
        })
    }

    fn clone_solver(&self) -> Box<dyn IterativeSolver> {
        Box::new(self.clone())
    }
}
