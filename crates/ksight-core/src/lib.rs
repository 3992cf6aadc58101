//! Shared data model and redaction engine for the KSight informer core.
//!
//! This crate has no Kubernetes client dependency and no I/O: it is the pure
//! core that `ksight-store` and `ksight-runtime` build on.

mod event;
mod gvr;
mod identity;
mod policy;
mod redactor;
mod value;

pub use event::{Event, EventType};
pub use gvr::Gvr;
pub use identity::{ClusterId, ObjectIdentity};
pub use policy::{PathSpec, Segment, SensitivityPolicy};
pub use redactor::{redact, redact_path};
pub use value::Value;

/// Kubernetes strips this annotation's twin before storing an object —
/// it is a UI-hostile duplicate of the object's last-applied configuration
/// and is never persisted to the Durable Cache.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Remove [`LAST_APPLIED_ANNOTATION`] from an object's `metadata.annotations`
/// map, if present. No-op if the object has no annotations or the key is
/// absent.
pub fn strip_last_applied_annotation(obj: &mut Value) {
    let Some(root) = obj.as_object_mut() else { return };
    let Some(metadata) = root.get_mut("metadata") else { return };
    let Some(metadata) = metadata.as_object_mut() else { return };
    let Some(annotations) = metadata.get_mut("annotations") else { return };
    let Some(annotations) = annotations.as_object_mut() else { return };
    annotations.shift_remove(LAST_APPLIED_ANNOTATION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_last_applied_annotation_only() {
        let mut obj: Value = json!({
            "metadata": {
                "name": "x",
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{...}",
                    "keep.me": "yes",
                }
            }
        })
        .into();
        strip_last_applied_annotation(&mut obj);
        let back: serde_json::Value = obj.into();
        assert_eq!(
            back,
            json!({"metadata": {"name": "x", "annotations": {"keep.me": "yes"}}})
        );
    }

    #[test]
    fn strip_is_a_noop_when_absent() {
        let mut obj: Value = json!({"metadata": {"name": "x"}}).into();
        strip_last_applied_annotation(&mut obj);
        let back: serde_json::Value = obj.into();
        assert_eq!(back, json!({"metadata": {"name": "x"}}));
    }
}
