//! Model and argument types shared across the server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque model instance.
///
/// The engine never inspects an instance; only the plugins registered for the
/// instance's model type know its shape. In memory an instance is a JSON
/// value, which keeps it serialisable across the worker-process boundary; its
/// at-rest byte representation is produced by the model type's `serialize`
/// plugin.
pub type Instance = Value;

/// A managed model: an opaque instance plus the metadata needed to identify
/// it and select plugins for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Identifier assigned by the backend on first registration. Never
    /// changes across fit updates.
    pub instance_id: u64,
    /// Dotted identifier selecting the plugin callables for this model.
    pub model_type: String,
    /// The live instance.
    pub instance: Instance,
}

impl Model {
    /// Returns a copy of this model carrying `instance` instead of the
    /// current one.
    pub fn replace_instance(&self, instance: Instance) -> Self {
        Self {
            instance_id: self.instance_id,
            model_type: self.model_type.clone(),
            instance,
        }
    }
}

/// Placeholder argument asking the engine to run the named data-access
/// plugin and substitute its result in place before the main plugin call.
///
/// Placeholders may appear in positional or keyword slots of
/// create/fit/predict. They do not nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAccess {
    /// Name of the data-access plugin to invoke.
    pub name: String,
    /// Positional arguments for the plugin call.
    pub args: Vec<Value>,
    /// Keyword arguments for the plugin call.
    pub kwargs: BTreeMap<String, Value>,
}

/// A positional or keyword argument of an engine operation: either a plain
/// value passed through unchanged, or a [`DataAccess`] placeholder resolved
/// before the main plugin runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// A deferred data-access call.
    DataAccess(DataAccess),
    /// A plain value.
    Value(Value),
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<DataAccess> for Argument {
    fn from(access: DataAccess) -> Self {
        Self::DataAccess(access)
    }
}

/// Fully materialised positional and keyword arguments for one plugin call.
///
/// Everything in here crosses the worker-process boundary, so values are
/// plain JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Creates call arguments from positional values only.
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replace_instance_keeps_identity() {
        let model = Model {
            instance_id: 3,
            model_type: "demo.tuple".to_string(),
            instance: json!([1, 2]),
        };
        let updated = model.replace_instance(json!([1, 2, 3]));
        assert_eq!(updated.instance_id, 3);
        assert_eq!(updated.model_type, "demo.tuple");
        assert_eq!(updated.instance, json!([1, 2, 3]));
    }

    #[test]
    fn test_argument_from_value() {
        let arg = Argument::from(json!(42));
        assert_eq!(arg, Argument::Value(json!(42)));
    }
}
