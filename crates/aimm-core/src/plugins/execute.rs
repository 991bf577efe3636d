//! Plugin dispatch shims.
//!
//! These functions look a plugin up in the registry, apply its calling
//! convention (progress-sink injection, instance placement) and run the
//! body. They are synchronous and CPU-bound by design: inside the server
//! they only ever run in a worker process or on a blocking thread.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ExecuteError, ExecuteResult};
use crate::model::{CallArgs, Instance};
use crate::plugins::{Call, PluginRegistry};

/// Progress sink handed to plugin bodies.
///
/// A thin wrapper over a frame writer; sending never blocks on backpressure
/// (writers drop frames under saturation).
#[derive(Clone)]
pub struct StateSink {
    sink: Arc<dyn Fn(Value) + Send + Sync>,
}

impl StateSink {
    /// Creates a sink forwarding every frame to `sink`.
    pub fn new(sink: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Creates a sink that discards every frame.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Reports one progress frame.
    pub fn send(&self, state: Value) {
        (self.sink)(state);
    }
}

impl fmt::Debug for StateSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateSink")
    }
}

/// Runs the data-access plugin registered under `name`.
pub fn exec_data_access(
    registry: &PluginRegistry,
    name: &str,
    state: StateSink,
    call_args: CallArgs,
) -> ExecuteResult<Value> {
    let plugin = registry.data_access(name)?;
    let call = convention(call_args, plugin.state_cb_arg_name.as_deref(), None, None, state)?;
    run(&plugin.function, call)
}

/// Runs the instantiate plugin for `model_type`.
pub fn exec_instantiate(
    registry: &PluginRegistry,
    model_type: &str,
    state: StateSink,
    call_args: CallArgs,
) -> ExecuteResult<Instance> {
    let plugin = registry.instantiate(model_type)?;
    let call = convention(call_args, plugin.state_cb_arg_name.as_deref(), None, None, state)?;
    run(&plugin.function, call)
}

/// Runs the fit plugin for `model_type`, returning the updated instance.
pub fn exec_fit(
    registry: &PluginRegistry,
    model_type: &str,
    instance: Instance,
    state: StateSink,
    call_args: CallArgs,
) -> ExecuteResult<Instance> {
    let plugin = registry.fit(model_type)?;
    let call = convention(
        call_args,
        plugin.state_cb_arg_name.as_deref(),
        plugin.instance_arg_name.as_deref(),
        Some(instance),
        state,
    )?;
    run(&plugin.function, call)
}

/// Runs the predict plugin for `model_type`, returning the prediction.
pub fn exec_predict(
    registry: &PluginRegistry,
    model_type: &str,
    instance: Instance,
    state: StateSink,
    call_args: CallArgs,
) -> ExecuteResult<Value> {
    let plugin = registry.predict(model_type)?;
    let call = convention(
        call_args,
        plugin.state_cb_arg_name.as_deref(),
        plugin.instance_arg_name.as_deref(),
        Some(instance),
        state,
    )?;
    run(&plugin.function, call)
}

/// Runs the serialize plugin for `model_type`.
pub fn exec_serialize(
    registry: &PluginRegistry,
    model_type: &str,
    instance: &Instance,
) -> ExecuteResult<Vec<u8>> {
    let plugin = registry.serialize(model_type)?;
    (plugin.function)(instance).map_err(|e| ExecuteError::Plugin {
        message: e.to_string(),
    })
}

/// Runs the deserialize plugin for `model_type`.
pub fn exec_deserialize(
    registry: &PluginRegistry,
    model_type: &str,
    instance_bytes: &[u8],
) -> ExecuteResult<Instance> {
    let plugin = registry.deserialize(model_type)?;
    (plugin.function)(instance_bytes).map_err(|e| ExecuteError::Plugin {
        message: e.to_string(),
    })
}

/// Applies the calling convention to one call.
///
/// The keyword slots named by the convention belong to the shim; a caller
/// supplying them is an error, not an override.
fn convention(
    mut call_args: CallArgs,
    state_cb_arg_name: Option<&str>,
    instance_arg_name: Option<&str>,
    instance: Option<Instance>,
    state: StateSink,
) -> ExecuteResult<Call> {
    if let Some(name) = state_cb_arg_name
        && call_args.kwargs.contains_key(name)
    {
        return Err(ExecuteError::ConflictingKeyword {
            name: name.to_string(),
        });
    }
    if let Some(instance) = instance {
        match instance_arg_name {
            Some(name) => {
                if call_args.kwargs.contains_key(name) {
                    return Err(ExecuteError::ConflictingKeyword {
                        name: name.to_string(),
                    });
                }
                call_args.kwargs.insert(name.to_string(), instance);
            }
            None => call_args.args.insert(0, instance),
        }
    }
    let state = if state_cb_arg_name.is_some() {
        state
    } else {
        StateSink::noop()
    };
    Ok(Call { call_args, state })
}

fn run(function: &super::PluginFn, call: Call) -> ExecuteResult<Value> {
    function(call).map_err(|e| ExecuteError::Plugin {
        message: format!("{e:#}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{DataAccessPlugin, FitPlugin, PredictPlugin};
    use parking_lot::Mutex;
    use serde_json::json;

    fn registry_with_fit(plugin: FitPlugin) -> PluginRegistry {
        let registry = PluginRegistry::new();
        registry.register_fit(&["m"], plugin).unwrap();
        registry
    }

    #[test]
    fn test_instance_prepended_by_default() {
        let registry = registry_with_fit(FitPlugin::new(|call| {
            Ok(json!(call.call_args.args))
        }));
        let result = exec_fit(
            &registry,
            "m",
            json!("instance"),
            StateSink::noop(),
            CallArgs::positional(vec![json!(1)]),
        )
        .unwrap();
        assert_eq!(result, json!(["instance", 1]));
    }

    #[test]
    fn test_instance_under_named_keyword() {
        let registry = registry_with_fit(
            FitPlugin::new(|call| Ok(call.call_args.kwargs["model"].clone()))
                .with_instance_arg("model"),
        );
        let result = exec_fit(
            &registry,
            "m",
            json!("instance"),
            StateSink::noop(),
            CallArgs::default(),
        )
        .unwrap();
        assert_eq!(result, json!("instance"));
    }

    #[test]
    fn test_conflicting_instance_keyword() {
        let registry = registry_with_fit(
            FitPlugin::new(|_| Ok(json!(null))).with_instance_arg("model"),
        );
        let mut call_args = CallArgs::default();
        call_args.kwargs.insert("model".to_string(), json!(1));
        let err = exec_fit(&registry, "m", json!(null), StateSink::noop(), call_args).unwrap_err();
        assert!(matches!(err, ExecuteError::ConflictingKeyword { name } if name == "model"));
    }

    #[test]
    fn test_conflicting_state_cb_keyword() {
        let registry = PluginRegistry::new();
        registry
            .register_data_access(
                "d",
                DataAccessPlugin::new(|_| Ok(json!(null))).with_state_cb("state_cb"),
            )
            .unwrap();
        let mut call_args = CallArgs::default();
        call_args.kwargs.insert("state_cb".to_string(), json!(1));
        let err = exec_data_access(&registry, "d", StateSink::noop(), call_args).unwrap_err();
        assert!(matches!(err, ExecuteError::ConflictingKeyword { name } if name == "state_cb"));
    }

    #[test]
    fn test_state_sink_only_injected_when_declared() {
        let frames = Arc::new(Mutex::new(Vec::new()));

        // Declared: frames reach the sink.
        let registry = PluginRegistry::new();
        registry
            .register_data_access(
                "loud",
                DataAccessPlugin::new(|call| {
                    call.state.send(json!("working"));
                    Ok(json!(null))
                })
                .with_state_cb("state_cb"),
            )
            .unwrap();
        // Not declared: the plugin runs blind and frames are dropped.
        registry
            .register_data_access(
                "blind",
                DataAccessPlugin::new(|call| {
                    call.state.send(json!("working"));
                    Ok(json!(null))
                }),
            )
            .unwrap();

        let sink_frames = Arc::clone(&frames);
        let sink = StateSink::new(move |frame| sink_frames.lock().push(frame));
        exec_data_access(&registry, "loud", sink.clone(), CallArgs::default()).unwrap();
        exec_data_access(&registry, "blind", sink, CallArgs::default()).unwrap();
        assert_eq!(*frames.lock(), vec![json!("working")]);
    }

    #[test]
    fn test_plugin_error_is_stringified() {
        let registry = PluginRegistry::new();
        registry
            .register_predict(
                &["m"],
                PredictPlugin::new(|_| anyhow::bail!("bad input shape")),
            )
            .unwrap();
        let err = exec_predict(
            &registry,
            "m",
            json!(null),
            StateSink::noop(),
            CallArgs::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecuteError::Plugin { message } if message.contains("bad input shape")));
    }
}
