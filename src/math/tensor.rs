use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::errors::NnError;

/// Dense `f64` tensor with shared storage.
///
/// Cloning a `Tensor` clones the *handle*: both copies read and write the same
/// values. Handles are `Send + Sync`, so a model or a partial result can be
/// moved to another thread. `view()` and `sub_tensor()` create zero-copy windows (offset + dims)
/// into the same storage; `deep_copy()` is the only way to get independent
/// values.
///
/// The leading dimension is the sample/row dimension. Block reads and writes
/// address whole rows along it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "TensorData", try_from = "TensorData")]
pub struct Tensor {
    dims: Vec<usize>,
    offset: usize,
    storage: Arc<RwLock<Vec<f64>>>,
}

/// Read access to the values of one tensor window.
pub struct TensorRef<'a> {
    guard: RwLockReadGuard<'a, Vec<f64>>,
    start: usize,
    end: usize,
}

impl Deref for TensorRef<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.guard[self.start..self.end]
    }
}

/// Write access to the values of one tensor window.
pub struct TensorMut<'a> {
    guard: RwLockWriteGuard<'a, Vec<f64>>,
    start: usize,
    end: usize,
}

impl Deref for TensorMut<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.guard[self.start..self.end]
    }
}

impl DerefMut for TensorMut<'_> {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.guard[self.start..self.end]
    }
}

/// On-disk form: dims plus the values of the window.
#[derive(Serialize, Deserialize)]
struct TensorData {
    dims: Vec<usize>,
    data: Vec<f64>,
}

impl From<Tensor> for TensorData {
    fn from(tensor: Tensor) -> TensorData {
        TensorData { data: tensor.to_vec(), dims: tensor.dims }
    }
}

impl TryFrom<TensorData> for Tensor {
    type Error = NnError;

    fn try_from(value: TensorData) -> Result<Tensor, NnError> {
        Tensor::from_vec(&value.dims, value.data)
    }
}

fn element_count(dims: &[usize]) -> Result<usize, NnError> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).ok_or_else(|| {
        NnError::MemoryAllocationFailed(format!("tensor of dims {dims:?} overflows usize"))
    })
}

impl Tensor {
    /// Allocates a zero-filled tensor.
    pub fn zeros(dims: &[usize]) -> Result<Tensor, NnError> {
        let len = element_count(dims)?;
        Ok(Tensor {
            dims: dims.to_vec(),
            offset: 0,
            storage: Arc::new(RwLock::new(vec![0.0; len])),
        })
    }

    /// Wraps `data` with the given dims; the element count must match.
    pub fn from_vec(dims: &[usize], data: Vec<f64>) -> Result<Tensor, NnError> {
        let len = element_count(dims)?;
        if len != data.len() {
            return Err(NnError::size_mismatch("tensor data", &[len], &[data.len()]));
        }
        Ok(Tensor {
            dims: dims.to_vec(),
            offset: 0,
            storage: Arc::new(RwLock::new(data)),
        })
    }

    /// Builds a 2-d tensor from equally long rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Tensor, NnError> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(NnError::size_mismatch("tensor row", &[cols], &[bad.len()]));
        }
        let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(&[rows.len(), cols], data)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of elements in this window.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the leading (sample) dimension.
    pub fn leading_dim(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    /// Elements per row of the leading dimension.
    pub fn row_len(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    /// Locks the storage for reading and exposes this window.
    pub fn data(&self) -> TensorRef<'_> {
        let guard = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        TensorRef { guard, start: self.offset, end: self.offset + self.len() }
    }

    /// Locks the storage for writing and exposes this window.
    ///
    /// Views share one lock: never hold a guard on a view while asking for
    /// write access to another view of the same buffer.
    pub fn data_mut(&self) -> TensorMut<'_> {
        let guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        TensorMut { guard, start: self.offset, end: self.offset + self.len() }
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.data().to_vec()
    }

    pub fn fill(&self, value: f64) {
        self.data_mut().iter_mut().for_each(|x| *x = value);
    }

    /// True when both handles point into the same storage buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Zero-copy window of `dims` starting `offset` elements into this one.
    pub fn view(&self, offset: usize, dims: &[usize]) -> Result<Tensor, NnError> {
        let len = element_count(dims)?;
        if offset + len > self.len() {
            return Err(NnError::size_mismatch(
                "tensor view",
                &[self.len()],
                &[offset + len],
            ));
        }
        Ok(Tensor {
            dims: dims.to_vec(),
            offset: self.offset + offset,
            storage: Arc::clone(&self.storage),
        })
    }

    /// Same values under different dims.
    pub fn reshaped(&self, dims: &[usize]) -> Result<Tensor, NnError> {
        if element_count(dims)? != self.len() {
            return Err(NnError::size_mismatch("reshape", &self.dims, dims));
        }
        self.view(0, dims)
    }

    /// Zero-copy window over rows `[first, first + count)` of the leading dimension.
    pub fn sub_tensor(&self, first: usize, count: usize) -> Result<Tensor, NnError> {
        self.check_rows(first, count)?;
        let mut dims = self.dims.clone();
        if dims.is_empty() {
            dims.push(count);
        } else {
            dims[0] = count;
        }
        self.view(first * self.row_len(), &dims)
    }

    /// Copies rows `[first, first + count)` of the leading dimension.
    pub fn read_block(&self, first: usize, count: usize) -> Result<Vec<f64>, NnError> {
        self.check_rows(first, count)?;
        let row = self.row_len();
        Ok(self.data()[first * row..(first + count) * row].to_vec())
    }

    /// Overwrites whole rows starting at `first`; `values` must hold full rows.
    pub fn write_block(&self, first: usize, values: &[f64]) -> Result<(), NnError> {
        let row = self.row_len();
        if row == 0 || values.len() % row != 0 {
            return Err(NnError::size_mismatch("block", &[row], &[values.len()]));
        }
        let count = values.len() / row;
        self.check_rows(first, count)?;
        self.data_mut()[first * row..(first + count) * row].copy_from_slice(values);
        Ok(())
    }

    /// Copies the values of `source` into this window. Element counts must match.
    pub fn assign(&self, source: &Tensor) -> Result<(), NnError> {
        if source.len() != self.len() {
            return Err(NnError::size_mismatch("assigned tensor", &[self.len()], &[source.len()]));
        }
        if self.shares_storage(source) {
            if self.offset == source.offset {
                return Ok(());
            }
            let values = source.to_vec();
            self.data_mut().copy_from_slice(&values);
        } else {
            self.data_mut().copy_from_slice(&source.data());
        }
        Ok(())
    }

    /// Independent copy of this window's values.
    pub fn deep_copy(&self) -> Tensor {
        Tensor {
            dims: self.dims.clone(),
            offset: 0,
            storage: Arc::new(RwLock::new(self.to_vec())),
        }
    }

    fn check_rows(&self, first: usize, count: usize) -> Result<(), NnError> {
        let rows = self.leading_dim();
        if first + count > rows {
            return Err(NnError::IncorrectParameter(format!(
                "rows [{first}, {}) exceed leading dimension {rows}",
                first + count
            )));
        }
        Ok(())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Tensor) -> bool {
        self.dims == other.dims && *self.data() == *other.data()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dims", &self.dims)
            .field("data", &&*self.data())
            .finish()
    }
}
