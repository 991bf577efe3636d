//! Plugin descriptors and the per-engine plugin registry.
//!
//! Six disjoint plugin kinds exist: `data_access`, `instantiate`, `fit`,
//! `predict`, `serialize` and `deserialize`. The first four share the
//! [`PluginFn`] signature and carry a calling convention describing where
//! the progress sink and (for fit/predict) the model instance are placed;
//! serialize/deserialize convert between a live instance and its byte
//! representation.
//!
//! The registry is scoped to an engine instance rather than the process, so
//! several engines with different plugin sets can coexist.

mod execute;

pub use execute::{
    StateSink, exec_data_access, exec_deserialize, exec_fit, exec_instantiate, exec_predict,
    exec_serialize,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RegistryError, RegistryResult};
use crate::model::{CallArgs, Instance};

// ─── Plugin kinds and callables ─────────────────────────────────────────────

/// The six plugin kinds, used as registry namespaces and in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Retrieves data substituted for a [`DataAccess`](crate::DataAccess)
    /// placeholder.
    DataAccess,
    /// Creates a new model instance.
    Instantiate,
    /// Produces an updated instance from an existing one.
    Fit,
    /// Produces a prediction from an instance.
    Predict,
    /// Converts an instance into bytes.
    Serialize,
    /// Converts bytes back into an instance.
    Deserialize,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DataAccess => "data_access",
            Self::Instantiate => "instantiate",
            Self::Fit => "fit",
            Self::Predict => "predict",
            Self::Serialize => "serialize",
            Self::Deserialize => "deserialize",
        };
        f.write_str(name)
    }
}

/// One call into a data-access, instantiate, fit or predict plugin.
///
/// The exec shims place the model instance into `args`/`kwargs` according to
/// the plugin's calling convention before the body runs.
pub struct Call {
    /// Materialised call arguments.
    pub call_args: CallArgs,
    /// Progress sink. A no-op sink when the plugin declared no
    /// `state_cb_arg_name` — the plugin then runs blind.
    pub state: StateSink,
}

/// Body of a data-access, instantiate, fit or predict plugin.
pub type PluginFn = Arc<dyn Fn(Call) -> anyhow::Result<Value> + Send + Sync>;

/// Body of a serialize plugin.
pub type SerializeFn = Arc<dyn Fn(&Instance) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Body of a deserialize plugin.
pub type DeserializeFn = Arc<dyn Fn(&[u8]) -> anyhow::Result<Instance> + Send + Sync>;

// ─── Descriptors ────────────────────────────────────────────────────────────

/// Data-access plugin and its call metadata.
#[derive(Clone)]
pub struct DataAccessPlugin {
    /// Plugin body.
    pub function: PluginFn,
    /// When set, a live progress sink is injected and the caller must not
    /// supply a keyword argument of this name.
    pub state_cb_arg_name: Option<String>,
}

/// Instantiate plugin and its call metadata.
#[derive(Clone)]
pub struct InstantiatePlugin {
    /// Plugin body.
    pub function: PluginFn,
    /// See [`DataAccessPlugin::state_cb_arg_name`].
    pub state_cb_arg_name: Option<String>,
}

/// Fit plugin and its call metadata.
#[derive(Clone)]
pub struct FitPlugin {
    /// Plugin body.
    pub function: PluginFn,
    /// See [`DataAccessPlugin::state_cb_arg_name`].
    pub state_cb_arg_name: Option<String>,
    /// When set, the current instance is passed under this keyword name;
    /// otherwise it is prepended as the first positional argument.
    pub instance_arg_name: Option<String>,
}

/// Predict plugin and its call metadata.
#[derive(Clone)]
pub struct PredictPlugin {
    /// Plugin body.
    pub function: PluginFn,
    /// See [`DataAccessPlugin::state_cb_arg_name`].
    pub state_cb_arg_name: Option<String>,
    /// See [`FitPlugin::instance_arg_name`].
    pub instance_arg_name: Option<String>,
}

/// Serialize plugin.
#[derive(Clone)]
pub struct SerializePlugin {
    /// Plugin body.
    pub function: SerializeFn,
}

/// Deserialize plugin.
#[derive(Clone)]
pub struct DeserializePlugin {
    /// Plugin body.
    pub function: DeserializeFn,
}

impl fmt::Debug for DataAccessPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAccessPlugin")
            .field("state_cb_arg_name", &self.state_cb_arg_name)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for InstantiatePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstantiatePlugin")
            .field("state_cb_arg_name", &self.state_cb_arg_name)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for FitPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FitPlugin")
            .field("state_cb_arg_name", &self.state_cb_arg_name)
            .field("instance_arg_name", &self.instance_arg_name)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for PredictPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictPlugin")
            .field("state_cb_arg_name", &self.state_cb_arg_name)
            .field("instance_arg_name", &self.instance_arg_name)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for SerializePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializePlugin").finish_non_exhaustive()
    }
}

impl fmt::Debug for DeserializePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeserializePlugin").finish_non_exhaustive()
    }
}

impl DataAccessPlugin {
    /// Wraps a plugin body with the default calling convention.
    pub fn new(function: impl Fn(Call) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            function: Arc::new(function),
            state_cb_arg_name: None,
        }
    }

    /// Declares the keyword name under which the progress sink is passed.
    pub fn with_state_cb(mut self, arg_name: impl Into<String>) -> Self {
        self.state_cb_arg_name = Some(arg_name.into());
        self
    }
}

impl InstantiatePlugin {
    /// Wraps a plugin body with the default calling convention.
    pub fn new(function: impl Fn(Call) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            function: Arc::new(function),
            state_cb_arg_name: None,
        }
    }

    /// Declares the keyword name under which the progress sink is passed.
    pub fn with_state_cb(mut self, arg_name: impl Into<String>) -> Self {
        self.state_cb_arg_name = Some(arg_name.into());
        self
    }
}

impl FitPlugin {
    /// Wraps a plugin body with the default calling convention.
    pub fn new(function: impl Fn(Call) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            function: Arc::new(function),
            state_cb_arg_name: None,
            instance_arg_name: None,
        }
    }

    /// Declares the keyword name under which the progress sink is passed.
    pub fn with_state_cb(mut self, arg_name: impl Into<String>) -> Self {
        self.state_cb_arg_name = Some(arg_name.into());
        self
    }

    /// Declares the keyword name under which the instance is passed.
    pub fn with_instance_arg(mut self, arg_name: impl Into<String>) -> Self {
        self.instance_arg_name = Some(arg_name.into());
        self
    }
}

impl PredictPlugin {
    /// Wraps a plugin body with the default calling convention.
    pub fn new(function: impl Fn(Call) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            function: Arc::new(function),
            state_cb_arg_name: None,
            instance_arg_name: None,
        }
    }

    /// Declares the keyword name under which the progress sink is passed.
    pub fn with_state_cb(mut self, arg_name: impl Into<String>) -> Self {
        self.state_cb_arg_name = Some(arg_name.into());
        self
    }

    /// Declares the keyword name under which the instance is passed.
    pub fn with_instance_arg(mut self, arg_name: impl Into<String>) -> Self {
        self.instance_arg_name = Some(arg_name.into());
        self
    }
}

impl SerializePlugin {
    /// Wraps a plugin body.
    pub fn new(
        function: impl Fn(&Instance) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            function: Arc::new(function),
        }
    }
}

impl DeserializePlugin {
    /// Wraps a plugin body.
    pub fn new(
        function: impl Fn(&[u8]) -> anyhow::Result<Instance> + Send + Sync + 'static,
    ) -> Self {
        Self {
            function: Arc::new(function),
        }
    }
}

/// The five non-data-access plugins of one model type, registered atomically.
#[derive(Clone)]
pub struct ModelPlugins {
    /// Instantiate plugin.
    pub instantiate: InstantiatePlugin,
    /// Fit plugin.
    pub fit: FitPlugin,
    /// Predict plugin.
    pub predict: PredictPlugin,
    /// Serialize plugin.
    pub serialize: SerializePlugin,
    /// Deserialize plugin.
    pub deserialize: DeserializePlugin,
}

// ─── Registry ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Declarations {
    data_access: HashMap<String, DataAccessPlugin>,
    instantiate: HashMap<String, InstantiatePlugin>,
    fit: HashMap<String, FitPlugin>,
    predict: HashMap<String, PredictPlugin>,
    serialize: HashMap<String, SerializePlugin>,
    deserialize: HashMap<String, DeserializePlugin>,
}

/// Table of plugin declarations, keyed by data-access name or model type.
///
/// Scoped to an engine instance. Registration happens at startup; lookups
/// happen on every action.
#[derive(Default)]
pub struct PluginRegistry {
    declarations: RwLock<Declarations>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry").finish_non_exhaustive()
    }
}

macro_rules! declare {
    ($map:expr, $kind:expr, $key:expr, $plugin:expr) => {{
        if $map.contains_key($key) {
            return Err(RegistryError::Duplicate {
                kind: $kind,
                key: $key.to_string(),
            });
        }
        $map.insert($key.to_string(), $plugin);
        Ok(())
    }};
}

macro_rules! lookup {
    ($map:expr, $kind:expr, $key:expr) => {
        $map.get($key).cloned().ok_or_else(|| RegistryError::Unknown {
            kind: $kind,
            key: $key.to_string(),
        })
    };
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a data-access plugin under `name`.
    pub fn register_data_access(&self, name: &str, plugin: DataAccessPlugin) -> RegistryResult<()> {
        let mut decl = self.declarations.write();
        declare!(decl.data_access, PluginKind::DataAccess, name, plugin)
    }

    /// Registers an instantiate plugin for `model_type`.
    pub fn register_instantiate(
        &self,
        model_type: &str,
        plugin: InstantiatePlugin,
    ) -> RegistryResult<()> {
        let mut decl = self.declarations.write();
        declare!(decl.instantiate, PluginKind::Instantiate, model_type, plugin)
    }

    /// Registers a fit plugin for every listed model type.
    pub fn register_fit(&self, model_types: &[&str], plugin: FitPlugin) -> RegistryResult<()> {
        let mut decl = self.declarations.write();
        for model_type in model_types {
            declare!(decl.fit, PluginKind::Fit, *model_type, plugin.clone())?;
        }
        Ok(())
    }

    /// Registers a predict plugin for every listed model type.
    pub fn register_predict(
        &self,
        model_types: &[&str],
        plugin: PredictPlugin,
    ) -> RegistryResult<()> {
        let mut decl = self.declarations.write();
        for model_type in model_types {
            declare!(decl.predict, PluginKind::Predict, *model_type, plugin.clone())?;
        }
        Ok(())
    }

    /// Registers a serialize plugin for every listed model type.
    pub fn register_serialize(
        &self,
        model_types: &[&str],
        plugin: SerializePlugin,
    ) -> RegistryResult<()> {
        let mut decl = self.declarations.write();
        for model_type in model_types {
            declare!(decl.serialize, PluginKind::Serialize, *model_type, plugin.clone())?;
        }
        Ok(())
    }

    /// Registers a deserialize plugin for every listed model type.
    pub fn register_deserialize(
        &self,
        model_types: &[&str],
        plugin: DeserializePlugin,
    ) -> RegistryResult<()> {
        let mut decl = self.declarations.write();
        for model_type in model_types {
            declare!(decl.deserialize, PluginKind::Deserialize, *model_type, plugin.clone())?;
        }
        Ok(())
    }

    /// Atomically registers all five non-data-access plugins of one model
    /// type. Nothing is bound if any of the five keys is already taken.
    pub fn register_model(&self, model_type: &str, plugins: ModelPlugins) -> RegistryResult<()> {
        let mut decl = self.declarations.write();
        let taken = [
            (decl.instantiate.contains_key(model_type), PluginKind::Instantiate),
            (decl.fit.contains_key(model_type), PluginKind::Fit),
            (decl.predict.contains_key(model_type), PluginKind::Predict),
            (decl.serialize.contains_key(model_type), PluginKind::Serialize),
            (decl.deserialize.contains_key(model_type), PluginKind::Deserialize),
        ];
        if let Some((_, kind)) = taken.iter().find(|(taken, _)| *taken) {
            return Err(RegistryError::Duplicate {
                kind: *kind,
                key: model_type.to_string(),
            });
        }
        decl.instantiate.insert(model_type.to_string(), plugins.instantiate);
        decl.fit.insert(model_type.to_string(), plugins.fit);
        decl.predict.insert(model_type.to_string(), plugins.predict);
        decl.serialize.insert(model_type.to_string(), plugins.serialize);
        decl.deserialize.insert(model_type.to_string(), plugins.deserialize);
        Ok(())
    }

    /// Looks up the data-access plugin registered under `name`.
    pub fn data_access(&self, name: &str) -> RegistryResult<DataAccessPlugin> {
        lookup!(self.declarations.read().data_access, PluginKind::DataAccess, name)
    }

    /// Looks up the instantiate plugin for `model_type`.
    pub fn instantiate(&self, model_type: &str) -> RegistryResult<InstantiatePlugin> {
        lookup!(self.declarations.read().instantiate, PluginKind::Instantiate, model_type)
    }

    /// Looks up the fit plugin for `model_type`.
    pub fn fit(&self, model_type: &str) -> RegistryResult<FitPlugin> {
        lookup!(self.declarations.read().fit, PluginKind::Fit, model_type)
    }

    /// Looks up the predict plugin for `model_type`.
    pub fn predict(&self, model_type: &str) -> RegistryResult<PredictPlugin> {
        lookup!(self.declarations.read().predict, PluginKind::Predict, model_type)
    }

    /// Looks up the serialize plugin for `model_type`.
    pub fn serialize(&self, model_type: &str) -> RegistryResult<SerializePlugin> {
        lookup!(self.declarations.read().serialize, PluginKind::Serialize, model_type)
    }

    /// Looks up the deserialize plugin for `model_type`.
    pub fn deserialize(&self, model_type: &str) -> RegistryResult<DeserializePlugin> {
        lookup!(self.declarations.read().deserialize, PluginKind::Deserialize, model_type)
    }

    /// Restores the registry to its empty state. Used by tests.
    pub fn clear(&self) {
        *self.declarations.write() = Declarations::default();
    }
}
