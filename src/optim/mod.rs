pub mod sgd;
pub mod solver;

pub use sgd::Sgd;
pub use solver::{IterativeSolver, ObjectiveFunction, PrecomputedObjective, SolverInput, SolverParameter, SolverResult};
