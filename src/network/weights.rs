//! Packing of per-layer weights and biases into one flat table.
//!
//! The table holds, for every layer in insertion order, its weight block
//! followed by its bias block. Layers without parameters take no space.
//! Two storage strategies produce the same table:
//!
//! - [`TensorBacked`]: every layer owns independent tensors; the table is
//!   marshalled on demand.
//! - [`TableBacked`]: one contiguous buffer is the storage; the per-layer
//!   tensors are zero-copy views into it.

use serde::{Deserialize, Serialize};

use crate::errors::NnError;
use crate::math::tensor::Tensor;

/// Which storage strategy backs a parameter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Tensors,
    Table,
}

/// Dims and offsets of every layer's parameter blocks. Built once per allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterLayout {
    weight_dims: Vec<Option<Vec<usize>>>,
    bias_dims: Vec<Option<Vec<usize>>>,
    weight_sizes: Vec<usize>,
    bias_sizes: Vec<usize>,
    /// `offsets[i]` is where layer `i` starts; the last entry is the total size.
    offsets: Vec<usize>,
}

fn block_size(dims: &Option<Vec<usize>>) -> Result<usize, NnError> {
    match dims {
        None => Ok(0),
        Some(dims) => dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).ok_or_else(|| {
            NnError::MemoryAllocationFailed(format!("parameter block {dims:?} overflows usize"))
        }),
    }
}

impl ParameterLayout {
    pub fn new(
        weight_dims: Vec<Option<Vec<usize>>>,
        bias_dims: Vec<Option<Vec<usize>>>,
    ) -> Result<ParameterLayout, NnError> {
        if weight_dims.len() != bias_dims.len() {
            return Err(NnError::IncorrectElementCountInCollection {
                collection: "bias dims".into(),
                expected: weight_dims.len(),
                actual: bias_dims.len(),
            });
        }
        let weight_sizes = weight_dims.iter().map(block_size).collect::<Result<Vec<_>, _>>()?;
        let bias_sizes = bias_dims.iter().map(block_size).collect::<Result<Vec<_>, _>>()?;

        let mut offsets = Vec::with_capacity(weight_dims.len() + 1);
        let mut total = 0usize;
        for (w, b) in weight_sizes.iter().zip(&bias_sizes) {
            offsets.push(total);
            total = total
                .checked_add(*w)
                .and_then(|t| t.checked_add(*b))
                .ok_or_else(|| NnError::MemoryAllocationFailed("parameter table overflows usize".into()))?;
        }
        offsets.push(total);

        Ok(ParameterLayout { weight_dims, bias_dims, weight_sizes, bias_sizes, offsets })
    }

    pub fn layer_count(&self) -> usize {
        self.weight_sizes.len()
    }

    pub fn weight_dims(&self, layer: usize) -> Option<&[usize]> {
        self.weight_dims.get(layer).and_then(|d| d.as_deref())
    }

    pub fn bias_dims(&self, layer: usize) -> Option<&[usize]> {
        self.bias_dims.get(layer).and_then(|d| d.as_deref())
    }

    pub fn weights_size(&self, layer: usize) -> usize {
        self.weight_sizes.get(layer).copied().unwrap_or(0)
    }

    pub fn biases_size(&self, layer: usize) -> usize {
        self.bias_sizes.get(layer).copied().unwrap_or(0)
    }

    pub fn layer_size(&self, layer: usize) -> usize {
        self.weights_size(layer) + self.biases_size(layer)
    }

    pub fn offset(&self, layer: usize) -> usize {
        self.offsets.get(layer).copied().unwrap_or(self.total_size())
    }

    pub fn total_size(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Indices of the layers that own at least one parameter.
    pub fn learnable_layers(&self) -> Vec<usize> {
        (0..self.layer_count()).filter(|&i| self.layer_size(i) > 0).collect()
    }

    fn check_layer(&self, layer: usize) -> Result<(), NnError> {
        if layer >= self.layer_count() {
            return Err(NnError::IncorrectParameter(format!(
                "layer {layer} out of range ({} layers)",
                self.layer_count()
            )));
        }
        Ok(())
    }

    fn check_table(&self, table: &Tensor, expected: usize) -> Result<(), NnError> {
        if table.len() != expected {
            return Err(NnError::size_mismatch("parameter table", &[expected], table.dims()));
        }
        Ok(())
    }
}

/// Common interface of both storage strategies.
pub trait PackedParameters {
    fn layout(&self) -> &ParameterLayout;

    /// The whole table, `[total_size]`.
    fn copy_to_table(&self) -> Result<Tensor, NnError>;

    /// One layer's slice, `[weights_size + biases_size]`.
    fn copy_layer_to_table(&self, layer: usize) -> Result<Tensor, NnError>;

    fn copy_from_table(&mut self, table: &Tensor) -> Result<(), NnError>;

    /// Overwrites one layer's parameters. Does nothing when `layer` is out of
    /// range or has no parameters.
    fn copy_layer_from_table(&mut self, table: &Tensor, layer: usize) -> Result<(), NnError>;
}

/// Per-layer tensors owned outside the store (typically by the caller).
#[derive(Debug, Clone)]
pub struct TensorBacked {
    layout: ParameterLayout,
    weights: Vec<Option<Tensor>>,
    biases: Vec<Option<Tensor>>,
}

impl TensorBacked {
    pub fn new(
        layout: ParameterLayout,
        weights: Vec<Option<Tensor>>,
        biases: Vec<Option<Tensor>>,
    ) -> Result<TensorBacked, NnError> {
        for layer in 0..layout.layer_count() {
            let w = weights.get(layer).and_then(Option::as_ref);
            let b = biases.get(layer).and_then(Option::as_ref);
            check_block(w, layout.weights_size(layer), "weights", layer)?;
            check_block(b, layout.biases_size(layer), "biases", layer)?;
        }
        Ok(TensorBacked { layout, weights, biases })
    }

    fn read_layer(&self, layer: usize, out: &mut [f64]) -> Result<(), NnError> {
        let split = self.layout.weights_size(layer);
        if let Some(w) = self.weights.get(layer).and_then(Option::as_ref) {
            out[..split].copy_from_slice(&w.read_block(0, w.leading_dim())?);
        }
        if let Some(b) = self.biases.get(layer).and_then(Option::as_ref) {
            out[split..].copy_from_slice(&b.read_block(0, b.leading_dim())?);
        }
        Ok(())
    }

    fn write_layer(&self, layer: usize, values: &[f64]) -> Result<(), NnError> {
        let split = self.layout.weights_size(layer);
        if let Some(w) = self.weights.get(layer).and_then(Option::as_ref) {
            w.write_block(0, &values[..split])?;
        }
        if let Some(b) = self.biases.get(layer).and_then(Option::as_ref) {
            b.write_block(0, &values[split..])?;
        }
        Ok(())
    }
}

fn check_block(tensor: Option<&Tensor>, expected: usize, what: &str, layer: usize) -> Result<(), NnError> {
    let actual = tensor.map(Tensor::len).unwrap_or(0);
    if actual != expected {
        return Err(NnError::size_mismatch(format!("{what} of layer {layer}"), &[expected], &[actual]));
    }
    Ok(())
}

impl PackedParameters for TensorBacked {
    fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    fn copy_to_table(&self) -> Result<Tensor, NnError> {
        let table = Tensor::zeros(&[self.layout.total_size()])?;
        {
            let mut values = table.data_mut();
            for layer in self.layout.learnable_layers() {
                let (start, end) = (self.layout.offset(layer), self.layout.offset(layer + 1));
                self.read_layer(layer, &mut values[start..end])?;
            }
        }
        Ok(table)
    }

    fn copy_layer_to_table(&self, layer: usize) -> Result<Tensor, NnError> {
        self.layout.check_layer(layer)?;
        let table = Tensor::zeros(&[self.layout.layer_size(layer)])?;
        self.read_layer(layer, &mut table.data_mut())?;
        Ok(table)
    }

    fn copy_from_table(&mut self, table: &Tensor) -> Result<(), NnError> {
        self.layout.check_table(table, self.layout.total_size())?;
        let values = table.to_vec();
        for layer in self.layout.learnable_layers() {
            let (start, end) = (self.layout.offset(layer), self.layout.offset(layer + 1));
            self.write_layer(layer, &values[start..end])?;
        }
        Ok(())
    }

    fn copy_layer_from_table(&mut self, table: &Tensor, layer: usize) -> Result<(), NnError> {
        if layer >= self.layout.layer_count() || self.layout.layer_size(layer) == 0 {
            return Ok(());
        }
        self.layout.check_table(table, self.layout.layer_size(layer))?;
        self.write_layer(layer, &table.to_vec())
    }
}

/// One contiguous buffer holding every layer's parameters.
#[derive(Debug, Clone)]
pub struct TableBacked {
    layout: ParameterLayout,
    buffer: Tensor,
}

impl TableBacked {
    pub fn new(layout: ParameterLayout) -> Result<TableBacked, NnError> {
        let buffer = Tensor::zeros(&[layout.total_size()])?;
        Ok(TableBacked { layout, buffer })
    }

    /// The backing buffer itself (not a copy).
    pub fn buffer(&self) -> &Tensor {
        &self.buffer
    }

    /// Zero-copy view of a layer's weights, `None` for layers without weights.
    pub fn weights_view(&self, layer: usize) -> Result<Option<Tensor>, NnError> {
        match self.layout.weight_dims(layer) {
            Some(dims) if self.layout.weights_size(layer) > 0 => {
                Ok(Some(self.buffer.view(self.layout.offset(layer), dims)?))
            }
            _ => Ok(None),
        }
    }

    /// Zero-copy view of a layer's biases, `None` for layers without biases.
    pub fn biases_view(&self, layer: usize) -> Result<Option<Tensor>, NnError> {
        match self.layout.bias_dims(layer) {
            Some(dims) if self.layout.biases_size(layer) > 0 => {
                let offset = self.layout.offset(layer) + self.layout.weights_size(layer);
                Ok(Some(self.buffer.view(offset, dims)?))
            }
            _ => Ok(None),
        }
    }

    fn layer_view(&self, layer: usize) -> Result<Tensor, NnError> {
        self.buffer.view(self.layout.offset(layer), &[self.layout.layer_size(layer)])
    }
}

impl PackedParameters for TableBacked {
    fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    /// Returns a handle to the backing buffer; writes through it are visible
    /// to every layer.
    fn copy_to_table(&self) -> Result<Tensor, NnError> {
        Ok(self.buffer.clone())
    }

    fn copy_layer_to_table(&self, layer: usize) -> Result<Tensor, NnError> {
        self.layout.check_layer(layer)?;
        Ok(self.layer_view(layer)?.deep_copy())
    }

    fn copy_from_table(&mut self, table: &Tensor) -> Result<(), NnError> {
        if table.shares_storage(&self.buffer) {
            return Ok(());
        }
        self.layout.check_table(table, self.layout.total_size())?;
        self.buffer.assign(table)
    }

    fn copy_layer_from_table(&mut self, table: &Tensor, layer: usize) -> Result<(), NnError> {
        if table.shares_storage(&self.buffer)
            || layer >= self.layout.layer_count()
            || self.layout.layer_size(layer) == 0
        {
            return Ok(());
        }
        self.layout.check_table(table, self.layout.layer_size(layer))?;
        self.layer_view(layer)?.assign(table)
    }
}

/// Parameter store of a model, with the strategy picked at allocation.
#[derive(Debug, Clone)]
pub enum WeightsAndBiases {
    Tensors(TensorBacked),
    Table(TableBacked),
}

impl WeightsAndBiases {
    pub fn kind(&self) -> StorageKind {
        match self {
            WeightsAndBiases::Tensors(_) => StorageKind::Tensors,
            WeightsAndBiases::Table(_) => StorageKind::Table,
        }
    }

    fn packed(&self) -> &dyn PackedParameters {
        match self {
            WeightsAndBiases::Tensors(store) => store,
            WeightsAndBiases::Table(store) => store,
        }
    }

    fn packed_mut(&mut self) -> &mut dyn PackedParameters {
        match self {
            WeightsAndBiases::Tensors(store) => store,
            WeightsAndBiases::Table(store) => store,
        }
    }
}

impl PackedParameters for WeightsAndBiases {
    fn layout(&self) -> &ParameterLayout {
        self.packed().layout()
    }

    fn copy_to_table(&self) -> Result<Tensor, NnError> {
        self.packed().copy_to_table()
    }

    fn copy_layer_to_table(&self, layer: usize) -> Result<Tensor, NnError> {
        self.packed().copy_layer_to_table(layer)
    }

    fn copy_from_table(&mut self, table: &Tensor) -> Result<(), NnError> {
        self.packed_mut().copy_from_table(table)
    }

    fn copy_layer_from_table(&mut self, table: &Tensor, layer: usize) -> Result<(), NnError> {
        self.packed_mut().copy_layer_from_table(table, layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // layer 0: none, layer 1: [2,3] + [3], layer 2: none, layer 3: [1,2] + [2]
    fn layout() -> ParameterLayout {
        ParameterLayout::new(
            vec![None, Some(vec![2, 3]), None, Some(vec![1, 2])],
            vec![None, Some(vec![3]), None, Some(vec![2])],
        )
        .unwrap()
    }

    fn tensor_backed() -> TensorBacked {
        let w1 = Tensor::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b1 = Tensor::from_vec(&[3], vec![7.0, 8.0, 9.0]).unwrap();
        let w3 = Tensor::from_vec(&[1, 2], vec![10.0, 11.0]).unwrap();
        let b3 = Tensor::from_vec(&[2], vec![12.0, 13.0]).unwrap();
        TensorBacked::new(layout(), vec![None, Some(w1), None, Some(w3)], vec![None, Some(b1), None, Some(b3)])
            .unwrap()
    }

    #[test]
    fn test_layout_offsets() {
        let layout = layout();
        assert_eq!(layout.total_size(), 13);
        assert_eq!(layout.offset(1), 0);
        assert_eq!(layout.offset(2), 9);
        assert_eq!(layout.offset(3), 9);
        assert_eq!(layout.learnable_layers(), vec![1, 3]);
        let sum: usize = (0..layout.layer_count()).map(|i| layout.layer_size(i)).sum();
        assert_eq!(sum, layout.total_size());
    }

    #[test]
    fn test_tensor_backed_marshals_in_order() {
        let store = tensor_backed();
        let table = store.copy_to_table().unwrap();
        assert_eq!(table.to_vec(), (1..=13).map(f64::from).collect::<Vec<_>>());
        assert_eq!(store.copy_layer_to_table(3).unwrap().to_vec(), vec![10.0, 11.0, 12.0, 13.0]);
        assert!(store.copy_layer_to_table(0).unwrap().is_empty());
        assert!(store.copy_layer_to_table(9).is_err());
    }

    #[test]
    fn test_tensor_backed_writes_back() {
        let mut store = tensor_backed();
        let slice = Tensor::from_vec(&[4], vec![-1.0, -2.0, -3.0, -4.0]).unwrap();
        store.copy_layer_from_table(&slice, 3).unwrap();
        let table = store.copy_to_table().unwrap().to_vec();
        assert_eq!(&table[..9], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(&table[9..], &[-1.0, -2.0, -3.0, -4.0]);

        assert!(store.copy_layer_from_table(&slice, 1).is_err());
        store.copy_layer_from_table(&slice, 0).unwrap();
        store.copy_layer_from_table(&slice, 42).unwrap();
    }

    #[test]
    fn test_table_backed_views_alias_buffer() {
        let store = TableBacked::new(layout()).unwrap();
        let w = store.weights_view(1).unwrap().unwrap();
        let b = store.biases_view(3).unwrap().unwrap();
        assert!(store.weights_view(0).unwrap().is_none());

        w.fill(1.0);
        b.fill(2.0);
        let table = store.copy_to_table().unwrap().to_vec();
        assert_eq!(&table[..6], &[1.0; 6]);
        assert_eq!(&table[11..], &[2.0, 2.0]);
    }

    #[test]
    fn test_table_backed_self_assign_is_noop() {
        let mut store = TableBacked::new(layout()).unwrap();
        let own = store.copy_to_table().unwrap();
        store.copy_from_table(&own).unwrap();
        let view = own.view(0, &[4]).unwrap();
        store.copy_layer_from_table(&view, 3).unwrap();
        assert!(store.copy_from_table(&Tensor::zeros(&[3]).unwrap()).is_err());
    }

    #[test]
    fn test_layer_roundtrip_leaves_others() {
        let mut store = TableBacked::new(layout()).unwrap();
        let values = Tensor::from_vec(&[13], (0..13).map(f64::from).collect()).unwrap();
        store.copy_from_table(&values).unwrap();

        let slice = store.copy_layer_to_table(1).unwrap();
        store.copy_layer_from_table(&slice, 1).unwrap();
        assert_eq!(store.copy_to_table().unwrap(), values);

        slice.fill(0.5);
        store.copy_layer_from_table(&slice, 1).unwrap();
        let table = store.copy_to_table().unwrap().to_vec();
        assert_eq!(&table[..9], &[0.5; 9]);
        assert_eq!(&table[9..], &[9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_strategies_agree() {
        let tensors = WeightsAndBiases::Tensors(tensor_backed());
        let mut table = WeightsAndBiases::Table(TableBacked::new(layout()).unwrap());
        table.copy_from_table(&tensors.copy_to_table().unwrap()).unwrap();
        assert_eq!(table.kind(), StorageKind::Table);
        for layer in 0..4 {
            assert_eq!(
                table.copy_layer_to_table(layer).unwrap(),
                tensors.copy_layer_to_table(layer).unwrap()
            );
        }
    }
}
