//! Informer Manager (C6): the public façade tying the Cluster Connection,
//! Watch Worker, Resource-Version Store and Durable Resource Cache together.

use crate::cluster::{ClusterConnection, ClusterStatus, WorkerEntry};
use crate::error::ClusterError;
use crate::watch_worker::{self, EventHandler, WorkerContext};
use kube::api::{Api, DynamicObject};
use ksight_core::{redact, ClusterId, Gvr, SensitivityPolicy, Value};
use ksight_store::{CacheStats, ResourceCache, VersionStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables the host supplies at construction instead of the core hard-coding
/// them, per the ambient configuration layer.
pub struct ManagerConfig {
    /// Root directory for `resource_versions.json` and `cache/resource_cache.db`.
    pub data_dir: PathBuf,
    /// Overrides the built-in default Sensitivity Policy if supplied.
    pub sensitivity_policy: Option<SensitivityPolicy>,
    /// Deadline for the synchronous pre-flight list that gates `addWatcher`,
    /// and separately for the background wait for the informer's initial
    /// sync (`InitDone`) once the Worker is spawned.
    pub cache_sync_timeout: Duration,
}

impl ManagerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sensitivity_policy: None,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
        }
    }
}

/// Snapshot of one registered cluster, returned from `listClusters`.
#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub status: Option<ClusterStatus>,
    pub last_error: Option<String>,
    pub pinned: bool,
    pub watchers: Vec<Gvr>,
}

/// Registry of Cluster Connections, public façade, event fan-out, lifecycle
/// and shutdown.
pub struct Manager {
    clusters: RwLock<HashMap<ClusterId, Arc<ClusterConnection>>>,
    cache: Arc<ResourceCache>,
    versions: Arc<VersionStore>,
    policy: Arc<SensitivityPolicy>,
    handler: EventHandler,
    cache_sync_timeout: Duration,
    shutdown_scope: CancellationToken,
}

impl Manager {
    /// Opens (or creates) the Durable Cache and Resource-Version Store under
    /// `config.data_dir`. Must be called from within a Tokio runtime.
    pub fn new(config: ManagerConfig, handler: EventHandler) -> Result<Self, ClusterError> {
        let policy = Arc::new(config.sensitivity_policy.unwrap_or_else(SensitivityPolicy::default_policy));
        let cache = ResourceCache::open(config.data_dir.join("cache").join("resource_cache.db"), policy.clone())
            .map_err(|e| ClusterError::Cache(e.to_string()))?;
        let versions = VersionStore::new(config.data_dir.join("resource_versions.json"));
        Ok(Self {
            clusters: RwLock::new(HashMap::new()),
            cache: Arc::new(cache),
            versions: Arc::new(versions),
            policy,
            handler,
            cache_sync_timeout: config.cache_sync_timeout,
            shutdown_scope: CancellationToken::new(),
        })
    }

    fn connection(&self, id: &ClusterId) -> Result<Arc<ClusterConnection>, ClusterError> {
        self.clusters
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownCluster(id.to_string()))
    }

    /// Parse the kubeconfig, build a dynamic client, and register the
    /// cluster. Replacing an id already in use aborts the prior
    /// connection's Watch Workers first, since the table in the spec does
    /// not document re-add semantics and leaking the old connection's
    /// background tasks would be worse than treating it as a fresh add.
    pub async fn add_cluster(
        &self,
        id: ClusterId,
        kubeconfig: &str,
        context: Option<&str>,
        pinned: bool,
    ) -> Result<(), ClusterError> {
        let connection = ClusterConnection::connect(kubeconfig, context, pinned).await?;
        connection.mark_connected();
        let connection = Arc::new(connection);
        if let Some(old) = self.clusters.write().insert(id, connection) {
            old.abort_all_workers();
        }
        Ok(())
    }

    /// Cascades to every Watch Worker on the cluster and purges its slice
    /// of the Version Store. Cache rows are retained (see `DESIGN.md`).
    pub fn remove_cluster(&self, id: &ClusterId) {
        if let Some(connection) = self.clusters.write().remove(id) {
            connection.abort_all_workers();
        }
        self.versions.delete_cluster(id.as_str());
    }

    pub fn list_clusters(&self) -> Vec<ClusterSummary> {
        self.clusters
            .read()
            .iter()
            .map(|(id, connection)| ClusterSummary {
                id: id.clone(),
                status: connection.status(),
                last_error: connection.last_error(),
                pinned: connection.pinned,
                watchers: connection.active_watchers(),
            })
            .collect()
    }

    /// Idempotent: a second `addWatcher` for an already-watched GVR is a
    /// no-op success.
    ///
    /// Runs the synchronous pre-flight list, then spawns the Watch Worker and
    /// returns without waiting for its initial sync: the Worker itself races
    /// `cache_sync_timeout` against the stream's `InitDone` in the background
    /// and marks the cluster `error` if the deadline wins, without aborting
    /// the Worker.
    pub async fn add_watcher(
        &self,
        cluster_id: &ClusterId,
        gvr: Gvr,
        namespace: Option<String>,
    ) -> Result<(), ClusterError> {
        let connection = self.connection(cluster_id)?;
        let key = gvr.to_key();
        if connection.workers.read().contains_key(&key) {
            return Ok(());
        }

        let api_resource = connection.resolve_api_resource(&gvr).await?;
        if let Err(e) = watch_worker::preflight_list(&connection, &api_resource, namespace.as_deref(), self.cache_sync_timeout).await
        {
            connection.mark_error(format!("{gvr}: {e}"));
            return Err(e);
        }
        connection.mark_connected();

        let ctx = WorkerContext {
            cluster: cluster_id.clone(),
            gvr: gvr.clone(),
            cache: self.cache.clone(),
            versions: self.versions.clone(),
            handler: self.handler.clone(),
        };
        let handle = tokio::spawn(watch_worker::run(
            connection.clone(),
            api_resource,
            namespace,
            ctx,
            self.cache_sync_timeout,
        ));

        let mut workers = connection.workers.write();
        // Re-check under the write lock: a concurrent `addWatcher` for the
        // same GVR could have won the race while we awaited discovery and
        // the pre-flight list above.
        if workers.contains_key(&key) {
            handle.abort();
            return Ok(());
        }
        workers.insert(key, WorkerEntry { gvr, handle });
        Ok(())
    }

    pub fn remove_watcher(&self, cluster_id: &ClusterId, gvr: &Gvr) -> Result<(), ClusterError> {
        let connection = self.connection(cluster_id)?;
        let mut workers = connection.workers.write();
        match workers.remove(&gvr.to_key()) {
            Some(entry) => {
                entry.handle.abort();
                Ok(())
            }
            None => Err(ClusterError::UnknownWatcher {
                cluster: cluster_id.to_string(),
                gvr: gvr.to_key(),
            }),
        }
    }

    /// `(objects, latest-version-hint)`. An empty result for an unknown
    /// (cluster, GVR) pair is indistinguishable from "no objects cached
    /// yet" — both are empty, which matches the cache-disabled fallback
    /// the spec calls for.
    pub fn load_initial(&self, cluster_id: &ClusterId, gvr: &Gvr) -> Result<(Vec<Value>, String), ClusterError> {
        self.connection(cluster_id)?;
        self.cache.load_all(cluster_id, gvr).map_err(|e| ClusterError::Cache(e.to_string()))
    }

    /// Cache hit returns the stored (possibly redacted) object directly.
    /// A miss falls through to a live point `Get` against the API server,
    /// redacted the same way a Watch Worker would redact it before
    /// delivery, but is not written back to the cache.
    pub async fn get_with_sensitivity(
        &self,
        cluster_id: &ClusterId,
        gvr: &Gvr,
        namespace: &str,
        name: &str,
    ) -> Result<(Value, bool), ClusterError> {
        // Validate the cluster is still registered before touching the
        // cache: `removeCluster` retains cache rows to accelerate a future
        // re-add, so a stale row for a removed cluster must not be served
        // as if the cluster were live.
        let connection = self.connection(cluster_id)?;

        if let Some(hit) = self.cache.get(cluster_id, gvr, namespace, name).map_err(|e| ClusterError::Cache(e.to_string()))? {
            return Ok(hit);
        }

        let api_resource = connection.resolve_api_resource(gvr).await?;
        let obj = fetch_live(&connection, &api_resource, namespace, name).await?;
        let value: Value = serde_json::to_value(&obj)
            .map_err(|e| ClusterError::Configuration(e.to_string()))?
            .into();
        Ok(redact(&self.policy, &gvr.group, &api_resource.kind, &value))
    }

    /// Bypasses the cache entirely and issues a point `Get` to the live API
    /// server, returning the un-redacted object regardless of sensitivity.
    pub async fn get_original(
        &self,
        cluster_id: &ClusterId,
        gvr: &Gvr,
        namespace: &str,
        name: &str,
    ) -> Result<Value, ClusterError> {
        let connection = self.connection(cluster_id)?;
        let api_resource = connection.resolve_api_resource(gvr).await?;
        let obj = fetch_live(&connection, &api_resource, namespace, name).await?;
        Ok(serde_json::to_value(&obj).map_err(|e| ClusterError::Configuration(e.to_string()))?.into())
    }

    pub fn cache_stats(&self) -> Result<CacheStats, ClusterError> {
        self.cache.stats().map_err(|e| ClusterError::Cache(e.to_string()))
    }

    pub fn clean_old_cache(&self, age: Duration) -> Result<u64, ClusterError> {
        self.cache.clean_older_than(age).map_err(|e| ClusterError::Cache(e.to_string()))
    }

    /// Cancels the Manager's cancellation scope, aborts every Watch
    /// Worker across every cluster, flushes the Version Store, and closes
    /// the cache. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown_scope.cancel();
        let connections: Vec<_> = self.clusters.write().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.abort_all_workers();
        }
        self.versions.shutdown().await;
        self.cache.close();
    }

    /// A child of the Manager's root cancellation scope, for a host that
    /// wants to tie its own long-running work to the Manager's lifetime.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_scope.child_token()
    }
}

async fn fetch_live(
    connection: &ClusterConnection,
    api_resource: &kube::discovery::ApiResource,
    namespace: &str,
    name: &str,
) -> Result<DynamicObject, ClusterError> {
    let api: Api<DynamicObject> = if namespace.is_empty() {
        Api::all_with(connection.client.clone(), api_resource)
    } else {
        Api::namespaced_with(connection.client.clone(), namespace, api_resource)
    };
    api.get(name).await.map_err(ClusterError::from_kube_error)
}
