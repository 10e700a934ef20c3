use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::errors::NnError;
use crate::layers::activation::ActivationLayer;
use crate::layers::concat::ConcatLayer;
use crate::layers::dense::DenseLayer;
use crate::layers::layer::Layer;
use crate::layers::loss::LossLayer;

/// Builds a layer prototype from its stored configuration.
pub type LayerConstructor = fn(serde_json::Value) -> Result<Box<dyn Layer>, NnError>;

/// Maps the `kind()` tag of a layer to the function that rebuilds it.
///
/// Built explicitly by the caller; topology files and model archives can only
/// contain kinds that are registered.
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    constructors: BTreeMap<String, LayerConstructor>,
}

/// Constructor for any layer whose configuration is its serde representation.
pub fn construct_from_config<L>(config: serde_json::Value) -> Result<Box<dyn Layer>, NnError>
where
    L: Layer + DeserializeOwned + 'static,
{
    let layer: L = serde_json::from_value(config)?;
    Ok(Box::new(layer))
}

impl LayerRegistry {
    /// Registry without any layer kinds.
    pub fn new() -> LayerRegistry {
        LayerRegistry::default()
    }

    /// Registry knowing the layers shipped with this crate.
    pub fn with_builtin_layers() -> LayerRegistry {
        let mut registry = LayerRegistry::new();
        registry.register("dense", construct_from_config::<DenseLayer>);
        registry.register("activation", construct_from_config::<ActivationLayer>);
        registry.register("concat", construct_from_config::<ConcatLayer>);
        registry.register("loss", construct_from_config::<LossLayer>);
        registry
    }

    /// Adds or replaces the constructor for `kind`.
    pub fn register(&mut self, kind: &str, constructor: LayerConstructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn construct(&self, kind: &str, config: serde_json::Value) -> Result<Box<dyn Layer>, NnError> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| NnError::UnknownLayerKind(kind.to_string()))?;
        constructor(config)
    }
}
