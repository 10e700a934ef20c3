pub mod nn_error;

pub use nn_error::{ErrorCollection, NnError};
