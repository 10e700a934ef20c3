use serde::{Deserialize, Serialize};

use crate::errors::{ErrorCollection, NnError};
use crate::layers::layer::Layer;
use crate::layers::registry::LayerRegistry;

/// One entry of a topology: the layer prototype and its outgoing edges.
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    index: usize,
    layer: Box<dyn Layer>,
    next: Vec<usize>,
}

impl LayerDescriptor {
    pub fn new(index: usize, layer: Box<dyn Layer>, next: Vec<usize>) -> LayerDescriptor {
        LayerDescriptor { index, layer, next }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn layer(&self) -> &dyn Layer {
        self.layer.as_ref()
    }

    /// Indices of the layers this one feeds, in edge order.
    pub fn next_layers(&self) -> &[usize] {
        &self.next
    }
}

/// Declarative, insertion-ordered description of a layer graph.
///
/// Layer 0 is the input layer. Layers run in index order, so every edge must
/// point to a higher index; this is checked when a model is allocated.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    layers: Vec<LayerDescriptor>,
}

/// Serialized form of one topology entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub kind: String,
    pub config: serde_json::Value,
    #[serde(default)]
    pub next: Vec<usize>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Appends a layer and returns the index assigned to it.
    pub fn push_back<L: Layer + 'static>(&mut self, layer: L) -> usize {
        self.push_back_boxed(Box::new(layer))
    }

    pub fn push_back_boxed(&mut self, layer: Box<dyn Layer>) -> usize {
        let index = self.layers.len();
        self.layers.push(LayerDescriptor::new(index, layer, Vec::new()));
        index
    }

    /// Records the edge `from -> to`.
    pub fn add_next(&mut self, from: usize, to: usize) -> Result<(), NnError> {
        let count = self.layers.len();
        if to >= count {
            return Err(NnError::IncorrectParameter(format!(
                "edge {from} -> {to}: layer {to} does not exist ({count} layers)"
            )));
        }
        let descriptor = self.layers.get_mut(from).ok_or_else(|| {
            NnError::IncorrectParameter(format!("edge {from} -> {to}: layer {from} does not exist ({count} layers)"))
        })?;
        descriptor.next.push(to);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LayerDescriptor> {
        self.layers.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LayerDescriptor> {
        self.layers.iter()
    }

    pub fn to_records(&self) -> Result<Vec<LayerRecord>, NnError> {
        self.layers
            .iter()
            .map(|d| {
                Ok(LayerRecord {
                    kind: d.layer.kind().to_string(),
                    config: d.layer.config()?,
                    next: d.next.clone(),
                })
            })
            .collect()
    }

    pub fn from_records(records: Vec<LayerRecord>, registry: &LayerRegistry) -> Result<Topology, NnError> {
        let mut topology = Topology::new();
        let mut edges = Vec::with_capacity(records.len());
        for record in records {
            let index = topology.push_back_boxed(registry.construct(&record.kind, record.config)?);
            edges.push((index, record.next));
        }
        for (from, next) in edges {
            for to in next {
                topology.add_next(from, to)?;
            }
        }
        Ok(topology)
    }

    /// Checks the edges; see [`validate_graph`].
    pub fn validate(&self) -> Result<(), NnError> {
        let next: Vec<Vec<usize>> = self.layers.iter().map(|d| d.next.clone()).collect();
        validate_graph(&next)
    }

    /// Serializes the topology to a pretty-printed JSON file.
    pub fn save_json(&self, path: &str) -> Result<(), NnError> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.to_records()?)?;
        Ok(())
    }

    /// Deserializes a topology from a JSON file, rebuilding layers through `registry`.
    pub fn load_json(path: &str, registry: &LayerRegistry) -> Result<Topology, NnError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let records: Vec<LayerRecord> = serde_json::from_reader(reader)?;
        Topology::from_records(records, registry)
    }
}

/// Structural checks run before a model is wired.
///
/// Every edge must point to an existing, higher-indexed layer, no edge may be
/// repeated, and every layer must be reachable from layer 0. All violations
/// are reported together.
pub fn validate_graph(next_layers: &[Vec<usize>]) -> Result<(), NnError> {
    let count = next_layers.len();
    if count == 0 {
        return Err(NnError::NullModel);
    }
    let mut errors = ErrorCollection::new();
    for (from, next) in next_layers.iter().enumerate() {
        for (ordinal, &to) in next.iter().enumerate() {
            if to >= count {
                errors.add(NnError::IncorrectParameter(format!(
                    "edge {from} -> {to}: layer {to} does not exist ({count} layers)"
                )));
            } else if to <= from {
                errors.add(NnError::IncorrectParameter(format!("edge {from} -> {to} does not point forward")));
            }
            if next[..ordinal].contains(&to) {
                errors.add(NnError::IncorrectParameter(format!("edge {from} -> {to} is repeated")));
            }
        }
    }

    let mut reached = vec![false; count];
    let mut stack = vec![0];
    while let Some(layer) = stack.pop() {
        if std::mem::replace(&mut reached[layer], true) {
            continue;
        }
        stack.extend(next_layers[layer].iter().filter(|&&n| n < count && !reached[n]));
    }
    for layer in (0..count).filter(|&i| !reached[i]) {
        errors.add(NnError::IncorrectParameter(format!("layer {layer} is not reachable from layer 0")));
    }
    errors.into_result()
}
