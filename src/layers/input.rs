use crate::errors::NnError;
use crate::math::tensor::Tensor;

/// Input slot that receives data tensors (one entry per incoming edge).
pub const DATA_SLOT: usize = 0;
/// Input slot that receives the ground truth of a loss layer.
pub const GROUND_TRUTH_SLOT: usize = 1;

/// One wired input tensor.
#[derive(Debug, Clone)]
pub struct InputEntry {
    pub tensor: Tensor,
    /// Ordinal of the edge this tensor arrived on, in the producer's edge list.
    pub edge_ordinal: usize,
    /// Set when the tensor is also read by someone else (fan-out or caller
    /// data). A layer must never compute in place on a shared input.
    pub shared: bool,
}

/// Input collection of a forward or backward layer.
///
/// Forward layers hold their data inputs in edge-arrival order; backward
/// layers hold the incoming gradients at the position of the matching
/// forward edge.
#[derive(Debug, Clone, Default)]
pub struct LayerInput {
    entries: Vec<Option<InputEntry>>,
    ground_truth: Option<Tensor>,
}

impl LayerInput {
    pub fn new() -> LayerInput {
        LayerInput::default()
    }

    /// Appends `tensor` to the next free position of `input_slot`.
    pub fn add(&mut self, tensor: Tensor, edge_ordinal: usize, input_slot: usize) -> Result<(), NnError> {
        match input_slot {
            DATA_SLOT => {
                self.entries.push(Some(InputEntry { tensor, edge_ordinal, shared: false }));
                Ok(())
            }
            GROUND_TRUTH_SLOT => {
                self.ground_truth = Some(tensor);
                Ok(())
            }
            other => Err(NnError::IncorrectParameter(format!("unknown input slot {other}"))),
        }
    }

    /// Places `tensor` at `position`, growing the collection as needed.
    pub fn set_at(&mut self, position: usize, tensor: Tensor, edge_ordinal: usize) {
        if self.entries.len() <= position {
            self.entries.resize(position + 1, None);
        }
        self.entries[position] = Some(InputEntry { tensor, edge_ordinal, shared: false });
    }

    /// Swaps the tensor at `position`, keeping its edge and sharing attributes.
    pub fn replace(&mut self, position: usize, tensor: Tensor) -> Result<(), NnError> {
        match self.entries.get_mut(position) {
            Some(Some(entry)) => {
                entry.tensor = tensor;
                Ok(())
            }
            _ => Err(NnError::NullTensor(format!("input {position}"))),
        }
    }

    pub fn mark_shared(&mut self, position: usize) {
        if let Some(Some(entry)) = self.entries.get_mut(position) {
            entry.shared = true;
        }
    }

    pub fn is_shared(&self, position: usize) -> bool {
        matches!(self.entries.get(position), Some(Some(entry)) if entry.shared)
    }

    /// Number of positions, including unfilled ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }

    pub fn get(&self, position: usize) -> Result<Tensor, NnError> {
        match self.entries.get(position) {
            Some(Some(entry)) => Ok(entry.tensor.clone()),
            _ => Err(NnError::NullTensor(format!("input {position}"))),
        }
    }

    /// All data tensors in position order; every position must be filled.
    pub fn tensors(&self) -> Result<Vec<Tensor>, NnError> {
        (0..self.entries.len()).map(|p| self.get(p)).collect()
    }

    pub fn ground_truth(&self) -> Result<Tensor, NnError> {
        self.ground_truth.clone().ok_or_else(|| NnError::NullTensor("ground truth".into()))
    }

    pub fn set_ground_truth(&mut self, tensor: Tensor) {
        self.ground_truth = Some(tensor);
    }

    /// Element-wise sum of every filled position. A single input is returned
    /// as is, without copying.
    pub fn summed(&self) -> Result<Tensor, NnError> {
        let mut present = self.entries.iter().flatten();
        let first = present
            .next()
            .ok_or_else(|| NnError::NullTensor("input gradient".into()))?;
        let rest: Vec<&InputEntry> = present.collect();
        if rest.is_empty() {
            return Ok(first.tensor.clone());
        }
        let total = first.tensor.deep_copy();
        {
            let mut acc = total.data_mut();
            for entry in rest {
                if entry.tensor.len() != acc.len() {
                    return Err(NnError::size_mismatch(
                        "input gradient",
                        first.tensor.dims(),
                        entry.tensor.dims(),
                    ));
                }
                for (a, g) in acc.iter_mut().zip(entry.tensor.data().iter()) {
                    *a += g;
                }
            }
        }
        Ok(total)
    }

    /// Drops every wired tensor.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.ground_truth = None;
    }
}
