//! Cluster Connection (C5): kubeconfig parsing, dynamic client construction,
//! and per-cluster connection state.

use crate::error::ClusterError;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersion;
use kube::discovery::{self, ApiCapabilities, ApiResource};
use kube::{Client, Config};
use ksight_core::Gvr;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::debug;

/// Connection health as last observed by a pre-flight list or a running
/// watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Connected,
    Error,
    Disconnected,
}

#[derive(Debug, Default)]
struct ClusterState {
    status: Option<ClusterStatus>,
    last_error: Option<String>,
}

/// One registered cluster: a dynamic client plus the set of running Watch
/// Workers keyed by `Gvr::to_key`.
///
/// Per §5, all mutable cluster state lives behind a single reader/writer
/// lock; the client itself is cheap to clone and carries its own internal
/// connection pool, so it is not behind the lock.
pub(crate) struct WorkerEntry {
    pub gvr: Gvr,
    pub handle: JoinHandle<()>,
}

pub struct ClusterConnection {
    pub client: Client,
    state: RwLock<ClusterState>,
    pub(crate) workers: RwLock<HashMap<String, WorkerEntry>>,
    pub(crate) pinned: bool,
}

impl ClusterConnection {
    /// Parse `kubeconfig` (a YAML blob, tried first, falling back to
    /// treating it as a filesystem path) and build a dynamic client scoped
    /// to `context`, if given.
    pub async fn connect(
        kubeconfig: &str,
        context: Option<&str>,
        pinned: bool,
    ) -> Result<Self, ClusterError> {
        let parsed = Kubeconfig::from_yaml(kubeconfig).or_else(|yaml_err| {
            Kubeconfig::read_from(kubeconfig).map_err(|path_err| {
                ClusterError::Configuration(format!(
                    "kubeconfig is neither valid YAML ({yaml_err}) nor a readable file ({path_err})"
                ))
            })
        })?;

        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(parsed, &options)
            .await
            .map_err(|e| ClusterError::Configuration(e.to_string()))?;
        let client = Client::try_from(config).map_err(|e| ClusterError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            state: RwLock::new(ClusterState::default()),
            workers: RwLock::new(HashMap::new()),
            pinned,
        })
    }

    pub fn status(&self) -> Option<ClusterStatus> {
        self.state.read().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn mark_connected(&self) {
        let mut guard = self.state.write();
        guard.status = Some(ClusterStatus::Connected);
        guard.last_error = None;
    }

    pub fn mark_error(&self, message: impl Into<String>) {
        let mut guard = self.state.write();
        guard.status = Some(ClusterStatus::Error);
        guard.last_error = Some(message.into());
    }

    pub fn mark_disconnected(&self) {
        let mut guard = self.state.write();
        guard.status = Some(ClusterStatus::Disconnected);
    }

    /// Resolve `gvr` against the live API server's discovery endpoint.
    ///
    /// `Gvr::resource` already names the plural REST endpoint, so this does
    /// not need `ApiResource::from_gvk`'s Kind-to-plural guesswork (which
    /// can be wrong for CRDs): a single discovery call lists every resource
    /// in the group/version and we pick the entry whose plural matches.
    pub async fn resolve_api_resource(&self, gvr: &Gvr) -> Result<ApiResource, ClusterError> {
        let gv = GroupVersion::gv(&gvr.group, &gvr.version);
        let group = discovery::oneshot::gv(&self.client, &gv)
            .await
            .map_err(ClusterError::from_kube_error)?;
        let resources: Vec<(ApiResource, ApiCapabilities)> = group.versioned_resources(&gvr.version);
        resources
            .into_iter()
            .map(|(ar, _caps)| ar)
            .find(|ar| ar.plural == gvr.resource)
            .ok_or_else(|| {
                ClusterError::Configuration(format!(
                    "resource \"{}\" not found in {}/{}",
                    gvr.resource, gvr.group, gvr.version
                ))
            })
    }

    /// Abort every running Watch Worker task for this cluster.
    pub(crate) fn abort_all_workers(&self) {
        let mut workers = self.workers.write();
        for (key, entry) in workers.drain() {
            debug!(gvr = %key, "aborting watch worker");
            entry.handle.abort();
        }
    }

    pub fn active_watchers(&self) -> Vec<Gvr> {
        self.workers.read().values().map(|e| e.gvr.clone()).collect()
    }
}

/// A minimal, network-free kubeconfig fixture shared by this module's tests
/// and by `watch_worker`'s: `Client::try_from(config)` builds lazily, so this
/// never performs any I/O.
#[cfg(test)]
pub(crate) fn test_kubeconfig_yaml() -> String {
    r#"
apiVersion: v1
kind: Config
clusters:
- name: test-cluster
  cluster:
    server: https://127.0.0.1:6443
    insecure-skip-tls-verify: true
contexts:
- name: test-context
  context:
    cluster: test-cluster
    user: test-user
current-context: test-context
users:
- name: test-user
  user:
    token: fake-token
"#
    .to_string()
}
