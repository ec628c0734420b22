//! Variable resolution for one evaluation.

use ahash::AHashMap;

use crate::{env::FunctionImpl, value::Value};

/// The global resolver: maps identifiers to values for one evaluation.
///
/// Implementations must not mutate during evaluation; the engine may look a
/// name up any number of times and expects a stable answer.
pub trait Activation {
    fn resolve(&self, name: &str) -> Option<Value>;
}

/// An activation backed by a hash map.
#[derive(Debug, Clone, Default)]
pub struct MapActivation {
    bindings: AHashMap<String, Value>,
}

impl MapActivation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.bindings.insert(name.into(), value);
        self
    }
}

impl Activation for MapActivation {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }
}

impl<const N: usize> From<[(&str, Value); N]> for MapActivation {
    fn from(entries: [(&str, Value); N]) -> Self {
        let mut activation = Self::new();
        for (name, value) in entries {
            activation.bind(name, value);
        }
        activation
    }
}

/// The activation with no bindings.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyActivation;

impl Activation for EmptyActivation {
    fn resolve(&self, _name: &str) -> Option<Value> {
        None
    }
}

/// Resolves late-bound call targets at evaluation time.
pub trait FunctionResolver {
    /// Returns an implementation for one of the given overload ids, or
    /// `None` when the call cannot be satisfied.
    fn resolve(&self, function: &str, overload_ids: &[String]) -> Option<FunctionImpl>;
}

/// A function resolver backed by an overload-id map.
#[derive(Default, Clone)]
pub struct MapFunctionResolver {
    bindings: AHashMap<String, FunctionImpl>,
}

impl MapFunctionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(
        &mut self,
        overload_id: impl Into<String>,
        binding: impl Fn(&[Value]) -> crate::error::EvalResult<Value> + Send + Sync + 'static,
    ) -> &mut Self {
        self.bindings
            .insert(overload_id.into(), std::sync::Arc::new(binding));
        self
    }
}

impl FunctionResolver for MapFunctionResolver {
    fn resolve(&self, _function: &str, overload_ids: &[String]) -> Option<FunctionImpl> {
        overload_ids
            .iter()
            .find_map(|id| self.bindings.get(id).cloned())
    }
}
