//! Cluster and object identity.

use crate::gvr::Gvr;
use std::fmt;
use std::sync::Arc;

/// Opaque, host-assigned identifier for a registered cluster.
///
/// Unique within the process for the lifetime of the Manager; never reused
/// after a `removeCluster`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(Arc<str>);

impl ClusterId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// The unique key of an observed object: `(cluster, GVR, namespace, name)`.
///
/// `namespace` is empty for cluster-scoped kinds. The API server's `uid` is
/// carried alongside for cache primary-keying but is not part of identity for
/// lookup purposes — two observations of the same tuple are the same object
/// even across a `uid` change (e.g. delete-then-recreate observed as a single
/// upsert before the delete event lands).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub cluster: ClusterId,
    pub gvr: Gvr,
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(cluster: ClusterId, gvr: Gvr, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster,
            gvr,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}/{}", self.cluster, self.gvr, self.name)
        } else {
            write!(f, "{}/{}/{}/{}", self.cluster, self.gvr, self.namespace, self.name)
        }
    }
}
