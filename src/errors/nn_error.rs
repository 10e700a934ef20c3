//! Error types shared by the graph engine, the layers and the training drivers.

use std::fmt;

use thiserror::Error;

/// Errors that can occur while building, allocating or training a model.
#[derive(Debug, Error)]
pub enum NnError {
    #[error("Model is not initialized")]
    NullModel,

    #[error("Result is not allocated: {0}")]
    NullResult(String),

    #[error("Incorrect parameter: {0}")]
    IncorrectParameter(String),

    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("Incorrect number of elements in {collection}: expected {expected}, got {actual}")]
    IncorrectElementCountInCollection {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("Tensor is missing: {0}")]
    NullTensor(String),

    #[error("Output collection is missing: {0}")]
    NullOutputCollection(String),

    #[error("Incorrect size of {what}: expected {expected:?}, got {actual:?}")]
    IncorrectSizeOfDimension {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Layer {layer} failed: {source}")]
    LayerCallFailed {
        layer: usize,
        #[source]
        source: Box<NnError>,
    },

    #[error("Model was allocated for batch size {model}, parameter requests {parameter}")]
    InconsistentModelAndBatchSizeInParameter { model: usize, parameter: usize },

    #[error("Solver must be initialized before updating weights and biases")]
    SolverNotInitialized,

    #[error("Solver failed: {source}")]
    SolverCallFailed {
        #[source]
        source: Box<NnError>,
    },

    #[error("Unknown layer kind: {0}")]
    UnknownLayerKind(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Multiple(ErrorCollection),
}

impl NnError {
    pub(crate) fn incorrect_parameter(message: impl Into<String>) -> NnError {
        NnError::IncorrectParameter(message.into())
    }

    pub(crate) fn size_mismatch(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> NnError {
        NnError::IncorrectSizeOfDimension {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Annotates the error with the index of the layer that produced it.
    pub fn in_layer(self, layer: usize) -> NnError {
        NnError::LayerCallFailed { layer, source: Box::new(self) }
    }

    /// Every leaf cause of this error, with `Multiple` flattened.
    pub fn causes(&self) -> Vec<&NnError> {
        match self {
            NnError::Multiple(collection) => {
                collection.iter().flat_map(|e| e.causes()).collect()
            }
            other => vec![other],
        }
    }
}

/// Accumulates several failures so that validation can report all of them
/// at once instead of stopping at the first.
#[derive(Debug, Default)]
pub struct ErrorCollection {
    errors: Vec<NnError>,
}

impl ErrorCollection {
    pub fn new() -> ErrorCollection {
        ErrorCollection { errors: Vec::new() }
    }

    pub fn add(&mut self, error: NnError) {
        self.errors.push(error);
    }

    /// Records the error of `result`, if any, and hands back the success value.
    pub fn check<T>(&mut self, result: Result<T, NnError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.errors.push(error);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NnError> {
        self.errors.iter()
    }

    /// `Ok` when nothing was recorded, the error itself when exactly one was,
    /// `NnError::Multiple` otherwise.
    pub fn into_result(mut self) -> Result<(), NnError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(NnError::Multiple(self)),
        }
    }
}

impl fmt::Display for ErrorCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors:", self.errors.len())?;
        for error in &self.errors {
            write!(f, " [{error}]")?;
        }
        Ok(())
    }
}
