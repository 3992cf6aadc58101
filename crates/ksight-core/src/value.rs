//! An owned, tagged-variant JSON tree.
//!
//! The Redactor and the Durable Cache both need to walk an arbitrary
//! Kubernetes object without knowing its schema. Per the redesign note in the
//! spec ("the source walks the JSON representation after marshalling,
//! remarshalling, and unmarshalling — this is both slow and lossy... a direct
//! tree rewrite is preferable"), we own a small tree type instead of bouncing
//! through `serde_json::Value` twice per redaction. Conversion to and from
//! `serde_json::Value` is a single infallible pass in each direction and
//! preserves object key order (`serde_json`'s `preserve_order` feature backs
//! its `Map` with an `IndexMap`, same as ours).

use indexmap::IndexMap;
use serde_json::Number;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn redacted() -> Value {
        Value::String("<redacted>".to_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(a) => serde_json::Value::Array(a.into_iter().map(Into::into).collect()),
            Value::Object(o) => {
                serde_json::Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_serde_json_preserving_key_order() {
        let original = json!({
            "z": 1,
            "a": {"nested": [1, 2, "three", null, true]},
            "m": "string",
        });
        let owned: Value = original.clone().into();
        let back: serde_json::Value = owned.into();
        assert_eq!(original, back);
        // key order survives because serde_json is built with preserve_order
        assert_eq!(
            back.as_object().unwrap().keys().collect::<Vec<_>>(),
            vec!["z", "a", "m"]
        );
    }
}
