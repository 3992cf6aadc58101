//! Group-version-resource identity for dynamically discovered API surfaces.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(group, version, resource-name)` triple addressing a Kubernetes API surface.
///
/// Unlike a group-version-kind, a `Gvr` names the plural REST endpoint
/// (`"pods"`, `"secrets"`) rather than the singular `Kind` — it is what a dynamic
/// client needs to build a request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// Stable `"group/version/resource"` string form, used as a map key
    /// throughout the Version Store and the Durable Cache.
    ///
    /// An empty group renders as `"/version/resource"`.
    pub fn to_key(&self) -> String {
        format!("{}/{}/{}", self.group, self.version, self.resource)
    }

    /// The `"group/Kind"` key used to look up a [`SensitivityPolicy`](crate::SensitivityPolicy) entry.
    pub fn policy_key(&self, kind: &str) -> String {
        if self.group.is_empty() {
            format!("/{kind}")
        } else {
            format!("{}/{kind}", self.group)
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}
