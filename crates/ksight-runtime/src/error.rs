//! Error taxonomy for cluster registration and watcher setup.

use thiserror::Error;

/// Errors surfaced synchronously from `addCluster` and `addWatcher`.
///
/// Everything past this boundary (malformed payloads, persistence failures,
/// mid-stream disconnects) is swallowed and logged rather than returned —
/// see `DESIGN.md`.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The supplied kubeconfig, context, or client construction failed.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),

    /// The pre-flight list call was rejected by the API server as
    /// unauthenticated or forbidden.
    #[error("unauthorized: {0}")]
    Authorization(String),

    /// A network-level failure reaching the API server (DNS, TCP, TLS).
    #[error("transient error contacting the cluster: {0}")]
    Transient(String),

    /// The pre-flight list did not complete within the configured deadline.
    #[error("timed out waiting for the initial list to complete")]
    CacheSyncTimeout,

    /// No cluster is registered under this id.
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// No watcher is registered for this (cluster, GVR) pair.
    #[error("no watcher registered for {cluster}/{gvr}")]
    UnknownWatcher { cluster: String, gvr: String },

    /// A version-store or durable-cache operation failed; these are
    /// best-effort elsewhere (swallowed and logged from within a Watch
    /// Worker), but a direct Manager call like `loadInitial` or
    /// `cacheStats` has no event to log against and reports it instead.
    #[error("cache or version store error: {0}")]
    Cache(String),
}

impl ClusterError {
    /// Classify a [`kube::Error`] into the taxonomy above. HTTP 401/403
    /// responses are authorization failures; everything else reaching the
    /// wire is treated as transient, matching the spec's "best-effort"
    /// stance on classifying arbitrary client errors.
    pub fn from_kube_error(err: kube::Error) -> Self {
        if let kube::Error::Api(ref resp) = err {
            if resp.code == 401 || resp.code == 403 {
                return ClusterError::Authorization(resp.message.clone());
            }
        }
        ClusterError::Transient(err.to_string())
    }
}
