//! The Event record forwarded to the host's event handler.

use crate::gvr::Gvr;
use crate::identity::ClusterId;
use crate::value::Value;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// One delivered observation of a single object's lifecycle transition.
///
/// At-least-once per informer callback, ordered per
/// `(cluster, gvr, namespace, name)`; no ordering is promised across keys.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub cluster: ClusterId,
    pub gvr: Gvr,
    pub namespace: String,
    pub name: String,
    /// The current (possibly redacted) object content.
    pub object: Value,
    /// The prior object content; populated only for `Modified`.
    pub prior_object: Option<Value>,
    pub observed_at: DateTime<Utc>,
}
