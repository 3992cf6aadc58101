//! Pure field-path redaction over an owned [`Value`] tree.

use crate::policy::{PathSpec, Segment, SensitivityPolicy};
use crate::value::Value;

/// Redact `obj` against `policy` for the given `group`/`kind`.
///
/// Returns `(redacted_copy, is_sensitive)`. If the kind is not configured in
/// the policy, `is_sensitive` is `false` and the returned value is an
/// unredacted deep copy — a copy is returned either way so the caller (the
/// Manager, ahead of a cache write) never has to reason about aliasing with
/// the original.
pub fn redact(policy: &SensitivityPolicy, group: &str, kind: &str, obj: &Value) -> (Value, bool) {
    let key = if group.is_empty() {
        format!("/{kind}")
    } else {
        format!("{group}/{kind}")
    };
    let Some(paths) = policy.paths_for(&key) else {
        return (obj.clone(), false);
    };
    let mut out = obj.clone();
    for path in paths {
        apply_path(&mut out, &path.segments);
    }
    (out, true)
}

fn apply_path(value: &mut Value, segments: &[Segment]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    match head {
        Segment::Field(name) => {
            let Some(obj) = value.as_object_mut() else {
                return;
            };
            let Some(slot) = obj.get_mut(name) else {
                return;
            };
            if rest.is_empty() {
                *slot = Value::redacted();
            } else {
                apply_path(slot, rest);
            }
        }
        Segment::Wildcard => {
            let Some(arr) = value.as_array_mut() else {
                return;
            };
            if rest.is_empty() {
                for elem in arr.iter_mut() {
                    redact_every_field(elem);
                }
            } else {
                for elem in arr.iter_mut() {
                    apply_path(elem, rest);
                }
            }
        }
    }
}

/// `[*]` with no trailing path: every field of an object element is
/// redacted; a non-object element is wholly replaced.
fn redact_every_field(elem: &mut Value) {
    if let Some(obj) = elem.as_object_mut() {
        for v in obj.values_mut() {
            *v = Value::redacted();
        }
    } else {
        *elem = Value::redacted();
    }
}

/// Convenience wrapper taking a path string directly, for callers outside
/// the hot path (e.g. tests) that don't want to pre-build a policy.
pub fn redact_path(obj: &mut Value, path: &str) {
    if let Some(spec) = PathSpec::parse(path) {
        apply_path(obj, &spec.segments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        j.into()
    }

    #[test]
    fn redacts_plain_field() {
        let mut obj = v(json!({"data": {"password": "c2VjcmV0"}}));
        redact_path(&mut obj, "data");
        let back: serde_json::Value = obj.into();
        assert_eq!(back, json!({"data": "<redacted>"}));
    }

    #[test]
    fn missing_intermediate_segment_is_a_silent_noop() {
        let mut obj = v(json!({"spec": {}}));
        redact_path(&mut obj, "spec.auth.token");
        let back: serde_json::Value = obj.into();
        assert_eq!(back, json!({"spec": {}}));
    }

    #[test]
    fn wildcard_with_suffix_redacts_only_that_field_per_element() {
        let mut obj = v(json!({"spec": {"rules": [{"name": "a", "value": "x"}, {"name": "b", "value": "y"}]}}));
        redact_path(&mut obj, "spec.rules.[*].value");
        let back: serde_json::Value = obj.into();
        assert_eq!(
            back,
            json!({"spec": {"rules": [{"name": "a", "value": "<redacted>"}, {"name": "b", "value": "<redacted>"}]}})
        );
    }

    #[test]
    fn wildcard_with_no_suffix_redacts_every_field_of_every_element() {
        let mut obj = v(json!({"items": [{"a": 1, "b": 2}, {"c": 3}]}));
        redact_path(&mut obj, "items.[*]");
        let back: serde_json::Value = obj.into();
        assert_eq!(back, json!({"items": [{"a": "<redacted>", "b": "<redacted>"}, {"c": "<redacted>"}]}));
    }

    #[test]
    fn non_object_kind_returns_unredacted_copy() {
        let policy = SensitivityPolicy::default_policy();
        let obj = v(json!({"data": {"password": "c2VjcmV0"}}));
        let (out, sensitive) = redact(&policy, "", "ConfigMap", &obj);
        assert!(!sensitive);
        let back: serde_json::Value = out.into();
        assert_eq!(back, json!({"data": {"password": "c2VjcmV0"}}));
    }

    #[test]
    fn secret_kind_redacts_data_and_string_data() {
        let policy = SensitivityPolicy::default_policy();
        let obj = v(json!({"data": {"password": "c2VjcmV0"}, "stringData": {"x": "y"}, "metadata": {"name": "s"}}));
        let (out, sensitive) = redact(&policy, "", "Secret", &obj);
        assert!(sensitive);
        let back: serde_json::Value = out.into();
        assert_eq!(
            back,
            json!({"data": "<redacted>", "stringData": "<redacted>", "metadata": {"name": "s"}})
        );
    }
}
