use log::debug;

use crate::errors::NnError;
use crate::math::tensor::Tensor;
use crate::optim::solver::{IterativeSolver, PrecomputedObjective, SolverInput};

/// Presents an iterative solver as a one-step weight updater.
///
/// The engine runs the sample loop itself, so every update runs the wrapped
/// solver for exactly one iteration on one batch, with the gradient of the
/// current backward pass as its objective. The solver's resumable state is
/// carried from one update to the next.
#[derive(Debug, Clone, Default)]
pub struct SolverAdapter {
    solver: Option<Box<dyn IterativeSolver>>,
    optional_state: Option<Tensor>,
    configured_iterations: usize,
    configured_batch_size: usize,
    n_updates: usize,
}

impl SolverAdapter {
    pub fn new() -> SolverAdapter {
        SolverAdapter::default()
    }

    /// Clones `prototype`; must be called before the first update.
    pub fn init(&mut self, prototype: &dyn IterativeSolver) {
        let solver = prototype.clone_solver();
        self.configured_iterations = solver.parameter().n_iterations;
        self.configured_batch_size = solver.parameter().batch_size;
        debug!(
            "solver configured with {} iterations, batch size {}",
            self.configured_iterations, self.configured_batch_size
        );
        self.solver = Some(solver);
        self.optional_state = None;
        self.n_updates = 0;
    }

    pub fn is_initialized(&self) -> bool {
        self.solver.is_some()
    }

    /// Runs one solver step from `weights` along `gradient` and returns the
    /// updated weights. Neither input is modified.
    pub fn update_weights_and_biases(&mut self, weights: &Tensor, gradient: &Tensor) -> Result<Tensor, NnError> {
        let solver = self.solver.as_mut().ok_or(NnError::SolverNotInitialized)?;
        let parameter = solver.parameter_mut();
        parameter.function = Box::new(PrecomputedObjective::with_gradient(gradient.clone()));
        parameter.n_iterations = 1;
        parameter.batch_size = 1;

        let input = SolverInput { argument: weights.clone(), optional_argument: self.optional_state.clone() };
        let result = solver
            .compute(&input)
            .map_err(|e| NnError::SolverCallFailed { source: Box::new(e) })?;
        self.optional_state = result.optional_result;
        self.n_updates += 1;
        Ok(result.minimum)
    }

    /// Iteration count the prototype was configured with.
    pub fn configured_iterations(&self) -> usize {
        self.configured_iterations
    }

    pub fn configured_batch_size(&self) -> usize {
        self.configured_batch_size
    }

    /// Updates run since `init`.
    pub fn n_updates(&self) -> usize {
        self.n_updates
    }

    pub fn optional_state(&self) -> Option<&Tensor> {
        self.optional_state.as_ref()
    }
}
