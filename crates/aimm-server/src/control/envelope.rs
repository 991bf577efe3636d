//! Wire-argument decoding shared by the controls.
//!
//! Arguments arrive as plain JSON values, `data_access` envelopes naming a
//! deferred plugin call, or tagged array/table envelopes
//! (`numpy_array`, `pandas_dataframe`, `pandas_series`) whose `data`
//! payload is unwrapped in place.

use std::collections::BTreeMap;

use serde_json::Value;

use aimm_core::model::{Argument, DataAccess};

/// Decodes a single wire argument.
pub fn arg_from_json(value: Value) -> Argument {
    let Some(tag) = value.get("type").and_then(Value::as_str) else {
        return Argument::Value(value);
    };
    match tag {
        "data_access" => {
            let name = value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = value
                .get("args")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let kwargs = value
                .get("kwargs")
                .and_then(Value::as_object)
                .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            Argument::DataAccess(DataAccess { name, args, kwargs })
        }
        "numpy_array" | "pandas_dataframe" | "pandas_series" => {
            Argument::Value(value.get("data").cloned().unwrap_or(Value::Null))
        }
        _ => Argument::Value(value),
    }
}

/// Decodes the `args` array of a request payload.
pub fn args_from_json(value: Option<&Value>) -> Vec<Argument> {
    value
        .and_then(Value::as_array)
        .map(|args| args.iter().cloned().map(arg_from_json).collect())
        .unwrap_or_default()
}

/// Decodes the `kwargs` object of a request payload.
pub fn kwargs_from_json(value: Option<&Value>) -> BTreeMap<String, Argument> {
    value
        .and_then(Value::as_object)
        .map(|kwargs| {
            kwargs
                .iter()
                .map(|(k, v)| (k.clone(), arg_from_json(v.clone())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_value_passes_through() {
        assert_eq!(arg_from_json(json!(42)), Argument::Value(json!(42)));
        assert_eq!(
            arg_from_json(json!({"type": "custom", "x": 1})),
            Argument::Value(json!({"type": "custom", "x": 1}))
        );
    }

    #[test]
    fn test_data_access_envelope() {
        let arg = arg_from_json(json!({
            "type": "data_access",
            "name": "readings",
            "args": [1],
            "kwargs": {"limit": 5},
        }));
        let Argument::DataAccess(access) = arg else {
            panic!("expected data access");
        };
        assert_eq!(access.name, "readings");
        assert_eq!(access.args, vec![json!(1)]);
        assert_eq!(access.kwargs.get("limit"), Some(&json!(5)));
    }

    #[test]
    fn test_array_envelopes_unwrap_data() {
        assert_eq!(
            arg_from_json(json!({"type": "numpy_array", "dtype": "f8", "data": [1.0, 2.0]})),
            Argument::Value(json!([1.0, 2.0]))
        );
        assert_eq!(
            arg_from_json(json!({"type": "pandas_series", "data": [3, 4]})),
            Argument::Value(json!([3, 4]))
        );
        assert_eq!(
            arg_from_json(json!({"type": "pandas_dataframe", "data": {"a": {"0": 1}}})),
            Argument::Value(json!({"a": {"0": 1}}))
        );
    }

    #[test]
    fn test_payload_args_and_kwargs() {
        let payload = json!({
            "args": [1, {"type": "data_access", "name": "d", "args": [], "kwargs": {}}],
            "kwargs": {"p": 3},
        });
        let args = args_from_json(payload.get("args"));
        assert_eq!(args.len(), 2);
        assert!(matches!(args[1], Argument::DataAccess(_)));
        let kwargs = kwargs_from_json(payload.get("kwargs"));
        assert_eq!(kwargs.get("p"), Some(&Argument::Value(json!(3))));
    }
}
