//! Generic iterative-solver abstraction the training drivers run against.

use std::fmt;

use crate::errors::NnError;
use crate::math::tensor::Tensor;

/// Objective minimised by an iterative solver.
pub trait ObjectiveFunction: fmt::Debug + Send {
    /// Gradient of the objective at `argument`.
    fn gradient(&self, argument: &Tensor) -> Result<Tensor, NnError>;

    /// Objective value at `argument`, when the function can evaluate it.
    fn value(&self, _argument: &Tensor) -> Option<f64> {
        None
    }

    fn clone_function(&self) -> Box<dyn ObjectiveFunction>;
}

impl Clone for Box<dyn ObjectiveFunction> {
    fn clone(&self) -> Self {
        self.clone_function()
    }
}

/// Objective whose gradient was computed elsewhere (by a backward pass) and
/// is handed to the solver as is.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedObjective {
    gradient: Option<Tensor>,
}

impl PrecomputedObjective {
    pub fn new() -> PrecomputedObjective {
        PrecomputedObjective::default()
    }

    pub fn with_gradient(gradient: Tensor) -> PrecomputedObjective {
        PrecomputedObjective { gradient: Some(gradient) }
    }

    pub fn set_gradient(&mut self, gradient: Tensor) {
        self.gradient = Some(gradient);
    }
}

impl ObjectiveFunction for PrecomputedObjective {
    fn gradient(&self, argument: &Tensor) -> Result<Tensor, NnError> {
        let gradient = self
            .gradient
            .as_ref()
            .ok_or_else(|| NnError::NullTensor("precomputed gradient".into()))?;
        if gradient.len() != argument.len() {
            return Err(NnError::size_mismatch("precomputed gradient", argument.dims(), gradient.dims()));
        }
        Ok(gradient.clone())
    }

    fn clone_function(&self) -> Box<dyn ObjectiveFunction> {
        Box::new(self.clone())
    }
}

/// Configuration common to every iterative solver.
#[derive(Debug, Clone)]
pub struct SolverParameter {
    pub function: Box<dyn ObjectiveFunction>,
    pub n_iterations: usize,
    pub batch_size: usize,
    /// Whether the solver hands back its resumable state.
    pub optional_result_required: bool,
}

impl SolverParameter {
    pub fn new(function: Box<dyn ObjectiveFunction>) -> SolverParameter {
        SolverParameter { function, n_iterations: 1, batch_size: 1, optional_result_required: false }
    }
}

#[derive(Debug, Clone)]
pub struct SolverInput {
    /// Starting point.
    pub argument: Tensor,
    /// State returned by a previous run, to resume from.
    pub optional_argument: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct SolverResult {
    pub minimum: Tensor,
    /// Resumable state, present when `optional_result_required` was set.
    pub optional_result: Option<Tensor>,
    pub n_iterations: usize,
}

/// A solver that iteratively moves an argument towards a minimum of its
/// objective function.
pub trait IterativeSolver: fmt::Debug + Send {
    fn parameter(&self) -> &SolverParameter;

    fn parameter_mut(&mut self) -> &mut SolverParameter;

    fn compute(&mut self, input: &SolverInput) -> Result<SolverResult, NnError>;

    fn clone_solver(&self) -> Box<dyn IterativeSolver>;
}

impl Clone for Box<dyn IterativeSolver> {
    fn clone(&self) -> Self {
        self.clone_solver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precomputed_gradient_checks_size() {
        let objective = PrecomputedObjective::with_gradient(Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap());
        let argument = Tensor::zeros(&[2]).unwrap();
        assert_eq!(objective.gradient(&argument).unwrap().to_vec(), vec![1.0, 2.0]);
        assert!(objective.gradient(&Tensor::zeros(&[3]).unwrap()).is_err());
        assert!(PrecomputedObjective::new().gradient(&argument).is_err());
        assert!(objective.value(&argument).is_none());
    }
}
