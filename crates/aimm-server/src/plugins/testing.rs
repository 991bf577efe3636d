//! Builtin `testing` plugin set.
//!
//! Small deterministic plugins used by the end-to-end tests and for smoke
//! checking deployments without real model code:
//!
//! - `testing.tuple`: instantiate records its arguments as `[args, kwargs]`,
//!   fit appends the fit arguments, predict returns the instance.
//! - `testing.echo`: predict returns `[args, kwargs]`, making argument
//!   substitution observable.
//! - `testing.sleeper`: fit and predict sleep for `seconds` before
//!   returning, for serialization and cancellation scenarios.
//! - `testing.constant` (data access): returns its first positional
//!   argument, or `[1, 2, 3]` when called without arguments.

use std::time::Duration;

use serde_json::{Value, json};

use aimm_core::error::RegistryError;
use aimm_core::plugins::{
    Call, DataAccessPlugin, DeserializePlugin, FitPlugin, InstantiatePlugin, ModelPlugins,
    PluginRegistry, PredictPlugin, SerializePlugin,
};

/// Registers the whole set.
pub fn register(registry: &PluginRegistry) -> Result<(), RegistryError> {
    registry.register_data_access("testing.constant", DataAccessPlugin::new(constant))?;
    registry.register_model(
        "testing.tuple",
        ModelPlugins {
            instantiate: InstantiatePlugin::new(record_call),
            fit: FitPlugin::new(append_call),
            predict: PredictPlugin::new(return_instance),
            serialize: SerializePlugin::new(|instance| Ok(serde_json::to_vec(instance)?)),
            deserialize: DeserializePlugin::new(|bytes| Ok(serde_json::from_slice(bytes)?)),
        },
    )?;
    registry.register_model(
        "testing.echo",
        ModelPlugins {
            instantiate: InstantiatePlugin::new(record_call),
            fit: FitPlugin::new(append_call),
            predict: PredictPlugin::new(echo_args),
            serialize: SerializePlugin::new(|instance| Ok(serde_json::to_vec(instance)?)),
            deserialize: DeserializePlugin::new(|bytes| Ok(serde_json::from_slice(bytes)?)),
        },
    )?;
    registry.register_model(
        "testing.sleeper",
        ModelPlugins {
            instantiate: InstantiatePlugin::new(record_call),
            fit: FitPlugin::new(sleep_then_instance),
            predict: PredictPlugin::new(sleep_then_instance),
            serialize: SerializePlugin::new(|instance| Ok(serde_json::to_vec(instance)?)),
            deserialize: DeserializePlugin::new(|bytes| Ok(serde_json::from_slice(bytes)?)),
        },
    )?;
    Ok(())
}

fn constant(call: Call) -> anyhow::Result<Value> {
    Ok(call
        .call_args
        .args
        .first()
        .cloned()
        .unwrap_or_else(|| json!([1, 2, 3])))
}

fn record_call(call: Call) -> anyhow::Result<Value> {
    Ok(json!([call.call_args.args, call.call_args.kwargs]))
}

/// Fit convention: the current instance arrives as the first positional
/// argument; the remaining arguments are appended to it.
fn append_call(call: Call) -> anyhow::Result<Value> {
    let mut args = call.call_args.args;
    if args.is_empty() {
        anyhow::bail!("missing instance argument");
    }
    let instance = args.remove(0);
    let mut accumulated = match instance {
        Value::Array(items) => items,
        other => vec![other],
    };
    accumulated.push(json!(args));
    accumulated.push(json!(call.call_args.kwargs));
    Ok(Value::Array(accumulated))
}

fn return_instance(call: Call) -> anyhow::Result<Value> {
    let mut args = call.call_args.args;
    if args.is_empty() {
        anyhow::bail!("missing instance argument");
    }
    Ok(args.remove(0))
}

fn echo_args(call: Call) -> anyhow::Result<Value> {
    let mut args = call.call_args.args;
    if args.is_empty() {
        anyhow::bail!("missing instance argument");
    }
    args.remove(0);
    Ok(json!([args, call.call_args.kwargs]))
}

fn sleep_then_instance(call: Call) -> anyhow::Result<Value> {
    let seconds = call
        .call_args
        .kwargs
        .get("seconds")
        .and_then(Value::as_f64)
        .or_else(|| call.call_args.args.get(1).and_then(Value::as_f64))
        .unwrap_or(0.0);
    call.state.send(json!({"sleeping": seconds}));
    std::thread::sleep(Duration::from_secs_f64(seconds));
    return_instance(call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimm_core::model::CallArgs;
    use aimm_core::plugins::{StateSink, exec_fit, exec_instantiate, exec_predict};
    use std::collections::BTreeMap;

    fn registry() -> PluginRegistry {
        let registry = PluginRegistry::new();
        register(&registry).unwrap();
        registry
    }

    #[test]
    fn test_tuple_lifecycle() {
        let registry = registry();
        let kwargs: BTreeMap<String, Value> = [("p".to_string(), json!(3))].into_iter().collect();
        let instance = exec_instantiate(
            &registry,
            "testing.tuple",
            StateSink::noop(),
            CallArgs {
                args: vec![json!(1), json!(2)],
                kwargs,
            },
        )
        .unwrap();
        assert_eq!(instance, json!([[1, 2], {"p": 3}]));

        let fitted = exec_fit(
            &registry,
            "testing.tuple",
            instance,
            StateSink::noop(),
            CallArgs::positional(vec![json!(4)]),
        )
        .unwrap();
        assert_eq!(fitted, json!([[1, 2], {"p": 3}, [4], {}]));

        let prediction = exec_predict(
            &registry,
            "testing.tuple",
            fitted.clone(),
            StateSink::noop(),
            CallArgs::default(),
        )
        .unwrap();
        assert_eq!(prediction, fitted);
    }

    #[test]
    fn test_echo_returns_call_args() {
        let registry = registry();
        let prediction = exec_predict(
            &registry,
            "testing.echo",
            json!(null),
            StateSink::noop(),
            CallArgs::positional(vec![json!([1, 2, 3])]),
        )
        .unwrap();
        assert_eq!(prediction, json!([[[1, 2, 3]], {}]));
    }

    #[test]
    fn test_sleeper_accepts_missing_duration() {
        let registry = registry();
        let prediction = exec_predict(
            &registry,
            "testing.sleeper",
            json!("model"),
            StateSink::noop(),
            CallArgs::default(),
        )
        .unwrap();
        assert_eq!(prediction, json!("model"));
    }
}
