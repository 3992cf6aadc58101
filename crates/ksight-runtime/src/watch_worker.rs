//! Watch Worker (C4): one informer stream per `(cluster, GVR)`.

use crate::cluster::ClusterConnection;
use crate::error::ClusterError;
use chrono::Utc;
use futures::StreamExt;
use ksight_core::{ClusterId, Event, EventType, Gvr, Value};
use ksight_store::{ResourceCache, VersionStore};
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::runtime::watcher::{self, Event as WatchEvent};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Everything a running Watch Worker needs beyond the `Api` handle itself.
pub struct WorkerContext {
    pub cluster: ClusterId,
    pub gvr: Gvr,
    pub cache: Arc<ResourceCache>,
    pub versions: Arc<VersionStore>,
    pub handler: EventHandler,
}

/// Pre-flight check: a `list` with `limit(1)` that exists purely to surface
/// authorization and connectivity failures synchronously from `addWatcher`,
/// before any background task is spawned.
pub async fn preflight_list(
    connection: &ClusterConnection,
    api_resource: &ApiResource,
    namespace: Option<&str>,
    deadline: Duration,
) -> Result<(), ClusterError> {
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(connection.client.clone(), ns, api_resource),
        None => Api::all_with(connection.client.clone(), api_resource),
    };
    let lp = ListParams::default().limit(1);
    match timeout(deadline, api.list(&lp)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ClusterError::from_kube_error(e)),
        Err(_) => Err(ClusterError::CacheSyncTimeout),
    }
}

/// Drive one `(cluster, GVR)` informer stream until the task is aborted.
///
/// Translates the upstream `watcher::Event` stream into core `Event`s and
/// invokes `ctx.handler` for each. `Apply` on an identity not yet seen in
/// this worker's lifetime (tracked in `seen`, not in the durable cache,
/// since the cache may already hold a row from a prior process lifetime
/// that this worker has not yet re-observed) is reported `Added`; `Apply`
/// on a previously-seen identity is `Modified`, with the prior object read
/// back from the Durable Cache. `Init` is bookkeeping-only; `InitDone`
/// additionally marks the initial sync complete (see `sync_deadline` below).
pub async fn run(
    connection: Arc<ClusterConnection>,
    api_resource: ApiResource,
    namespace: Option<String>,
    ctx: WorkerContext,
    sync_deadline: Duration,
) {
    let api: Api<DynamicObject> = match &namespace {
        Some(ns) => Api::namespaced_with(connection.client.clone(), ns, &api_resource),
        None => Api::all_with(connection.client.clone(), &api_resource),
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    tokio::pin!(stream);
    // The returned handles are detached background cache writes; dropping
    // them does not abort the tasks, it just stops tracking their completion.
    let _pending_writes = drive(stream, ctx, connection, sync_deadline).await;
}

/// The event-translation loop itself, generic over the upstream stream so it
/// can be driven by a scripted in-memory sequence of `watcher::Event`s in
/// tests (the spec's own embedded-test harness that brings up a throwaway
/// API server is explicitly out of scope for this core).
///
/// Awaits the informer's initial sync (`InitDone`) within `sync_deadline`.
/// If the deadline elapses first, `connection` is marked `error` with a
/// message naming the GVR, but the Worker keeps running — the stream is not
/// aborted, matching the spec's "Worker is nevertheless left registered so a
/// subsequent retry can be implemented by removing and re-adding".
///
/// Returns the [`JoinHandle`]s of every Durable Cache write spawned while
/// driving this stream to completion. Production callers (`run`) drop them
/// and let the writes finish in the background; tests that need to observe
/// the cache in a settled state await them explicitly instead of assuming
/// the write landed synchronously (per §5: "a reader immediately after an
/// event sees either the new or the prior value").
async fn drive<S>(
    mut stream: S,
    ctx: WorkerContext,
    connection: Arc<ClusterConnection>,
    sync_deadline: Duration,
) -> Vec<JoinHandle<()>>
where
    S: futures::Stream<Item = watcher::Result<WatchEvent<DynamicObject>>> + Unpin,
{
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut sync_deadline = Some(sync_deadline);
    let mut pending_writes = Vec::new();

    loop {
        let event = match sync_deadline {
            Some(deadline) => match timeout(deadline, stream.next()).await {
                Ok(event) => event,
                Err(_) => {
                    connection.mark_error(format!(
                        "{}: initial sync did not complete within {}s",
                        ctx.gvr,
                        deadline.as_secs()
                    ));
                    sync_deadline = None;
                    continue;
                }
            },
            None => stream.next().await,
        };

        let Some(event) = event else { break };

        match event {
            Ok(WatchEvent::Init) => {}
            Ok(WatchEvent::InitDone) => {
                sync_deadline = None;
            }
            Ok(WatchEvent::InitApply(obj)) => {
                seen.insert(identity_key(&obj));
                if let Some(handle) = handle_upsert(&ctx, obj, EventType::Added).await {
                    pending_writes.push(handle);
                }
            }
            Ok(WatchEvent::Apply(obj)) => {
                let key = identity_key(&obj);
                let event_type = if seen.insert(key) {
                    EventType::Added
                } else {
                    EventType::Modified
                };
                if let Some(handle) = handle_upsert(&ctx, obj, event_type).await {
                    pending_writes.push(handle);
                }
            }
            Ok(WatchEvent::Delete(obj)) => {
                seen.remove(&identity_key(&obj));
                handle_delete(&ctx, obj).await;
            }
            Err(e) => {
                warn!(
                    cluster = %ctx.cluster,
                    gvr = %ctx.gvr,
                    error = %e,
                    "watch stream error, kube-runtime will retry with backoff"
                );
            }
        }
    }

    debug!(cluster = %ctx.cluster, gvr = %ctx.gvr, "watch stream ended");
    pending_writes
}

fn identity_key(obj: &DynamicObject) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Translate one add/update into a core `Event` and return the [`JoinHandle`]
/// of the Durable Cache write spawned for it (`None` if the event was dropped
/// before reaching the cache, e.g. on an encode failure).
///
/// The handler is invoked with the redacted-for-delivery value computed
/// directly (pure, no I/O) rather than waiting on the database: per §4.6
/// step 3 and §5, "cache writes... keep callbacks non-blocking", so the
/// actual upsert is pushed onto `spawn_blocking` (`rusqlite` is a blocking
/// call) and not awaited here, the same way the Version Store's own saves
/// are offloaded from the hot path in `version_store.rs`.
async fn handle_upsert(ctx: &WorkerContext, obj: DynamicObject, event_type: EventType) -> Option<JoinHandle<()>> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let uid = obj.uid().unwrap_or_default();
    let resource_version = obj.resource_version().unwrap_or_default();

    let prior_object = if event_type == EventType::Modified {
        match ctx.cache.get(&ctx.cluster, &ctx.gvr, &namespace, &name) {
            Ok(Some((value, _sensitive))) => Some(value),
            Ok(None) => None,
            Err(e) => {
                warn!(cluster = %ctx.cluster, gvr = %ctx.gvr, error = %e, "failed to read prior object from cache");
                None
            }
        }
    } else {
        None
    };

    let object: Value = match serde_json::to_value(&obj) {
        Ok(json) => json.into(),
        Err(e) => {
            warn!(cluster = %ctx.cluster, gvr = %ctx.gvr, error = %e, "failed to encode object, dropping event");
            return None;
        }
    };

    // Never fall back to the raw, pre-redaction `object` here: the handler
    // must see the redacted twin whether or not the background write below
    // ever lands.
    let delivered = ctx.cache.redact_for_delivery(&ctx.gvr, &object);

    let cache = ctx.cache.clone();
    let cluster = ctx.cluster.clone();
    let gvr = ctx.gvr.clone();
    let write_uid = uid.clone();
    let write_namespace = namespace.clone();
    let write_name = name.clone();
    let write_resource_version = resource_version.clone();
    let write_object = object.clone();
    let handle = tokio::task::spawn_blocking(move || {
        if let Err(e) = cache.store(
            &cluster,
            &gvr,
            &write_uid,
            &write_namespace,
            &write_name,
            &write_resource_version,
            &write_object,
        ) {
            warn!(cluster = %cluster, gvr = %gvr, error = %e, "failed to persist object to durable cache");
        }
    });

    ctx.versions.set(ctx.cluster.as_str(), &ctx.gvr.to_key(), &resource_version);

    (ctx.handler)(Event {
        event_type,
        cluster: ctx.cluster.clone(),
        gvr: ctx.gvr.clone(),
        namespace,
        name,
        object: delivered,
        prior_object,
        observed_at: Utc::now(),
    });

    Some(handle)
}

async fn handle_delete(ctx: &WorkerContext, obj: DynamicObject) {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let resource_version = obj.resource_version().unwrap_or_default();
    let object: Value = match serde_json::to_value(&obj) {
        Ok(json) => json.into(),
        Err(e) => {
            warn!(cluster = %ctx.cluster, gvr = %ctx.gvr, error = %e, "failed to encode deleted object, dropping event");
            return;
        }
    };

    // Delete events carry the object's own (often incremented) resource
    // version and must advance the Version Store the same as an upsert.
    ctx.versions.set(ctx.cluster.as_str(), &ctx.gvr.to_key(), &resource_version);

    (ctx.handler)(Event {
        event_type: EventType::Deleted,
        cluster: ctx.cluster.clone(),
        gvr: ctx.gvr.clone(),
        namespace,
        name,
        object,
        prior_object: None,
        observed_at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{test_kubeconfig_yaml, ClusterStatus};
    use parking_lot::Mutex;
    use serde_json::json;

    async fn connection() -> Arc<ClusterConnection> {
        Arc::new(ClusterConnection::connect(&test_kubeconfig_yaml(), None, false).await.unwrap())
    }

    fn pod(name: &str, resource_version: &str, labels: Option<serde_json::Value>) -> DynamicObject {
        let mut obj: serde_json::Value = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "uid": format!("uid-{name}"),
                "resourceVersion": resource_version,
            },
            "spec": {},
        });
        if let Some(labels) = labels {
            obj["metadata"]["labels"] = labels;
        }
        serde_json::from_value(obj).unwrap()
    }

    fn context() -> (WorkerContext, tempfile::TempDir, Arc<Mutex<Vec<Event>>>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            ResourceCache::open(
                dir.path().join("cache").join("resource_cache.db"),
                Arc::new(ksight_core::SensitivityPolicy::default_policy()),
            )
            .unwrap(),
        );
        let versions = Arc::new(VersionStore::new(dir.path().join("resource_versions.json")));
        let received: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let ctx = WorkerContext {
            cluster: ClusterId::new("c1"),
            gvr: Gvr::new("", "v1", "pods"),
            cache,
            versions,
            handler: Arc::new(move |event| sink.lock().push(event)),
        };
        (ctx, dir, received)
    }

    fn events_stream(events: Vec<watcher::Result<WatchEvent<DynamicObject>>>) -> impl futures::Stream<Item = watcher::Result<WatchEvent<DynamicObject>>> + Unpin {
        futures::stream::iter(events)
    }

    /// Scenario 1 from the spec's §8: a pod through Added → Modified → Deleted.
    /// The Delete carries its own, higher resource version than the preceding
    /// Modified so the test cannot pass by accident of both sharing one RV.
    #[tokio::test]
    async fn full_lifecycle_emits_added_modified_deleted_in_order() {
        let (ctx, _dir, received) = context();
        let created = pod("p", "100", None);
        let updated = pod("p", "101", Some(json!({"env": "prod"})));
        let deleted = pod("p", "102", Some(json!({"env": "prod"})));

        let stream = events_stream(vec![
            Ok(WatchEvent::Init),
            Ok(WatchEvent::InitApply(created.clone())),
            Ok(WatchEvent::InitDone),
            Ok(WatchEvent::Apply(updated.clone())),
            Ok(WatchEvent::Delete(deleted)),
        ]);
        let versions = ctx.versions.clone();
        let pending_writes = drive(stream, ctx, connection().await, Duration::from_secs(30)).await;
        for handle in pending_writes {
            handle.await.unwrap();
        }

        let events = received.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, EventType::Added);
        assert_eq!(events[0].name, "p");
        assert_eq!(events[1].event_type, EventType::Modified);
        let prior = events[1].prior_object.as_ref().expect("modified event carries prior object");
        let prior_json: serde_json::Value = prior.clone().into();
        assert!(prior_json["metadata"]["labels"].is_null());
        let current_json: serde_json::Value = events[1].object.clone().into();
        assert_eq!(current_json["metadata"]["labels"]["env"], "prod");
        assert_eq!(events[2].event_type, EventType::Deleted);

        // IP-2: the version store reflects the greatest version observed,
        // including the Delete's own resource version.
        assert_eq!(versions.get("c1", "/v1/pods"), "102");
    }

    /// IP-3, scenario 3: a Secret is redacted before it ever reaches the handler.
    #[tokio::test]
    async fn sensitive_object_is_redacted_before_reaching_handler() {
        let (mut ctx, _dir, received) = context();
        ctx.gvr = Gvr::new("", "v1", "secrets");
        let secret: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "s", "namespace": "default", "uid": "uid-s", "resourceVersion": "1"},
            "data": {"password": "c2VjcmV0"},
        }))
        .unwrap();

        let stream = events_stream(vec![Ok(WatchEvent::Apply(secret))]);
        let cache = ctx.cache.clone();
        let pending_writes = drive(stream, ctx, connection().await, Duration::from_secs(30)).await;
        // The cache write happens on a separate task; await it explicitly
        // before reading the row back, since §5 only promises the write
        // lands eventually, not by the time `drive` returns.
        for handle in pending_writes {
            handle.await.unwrap();
        }

        let events = received.lock();
        assert_eq!(events.len(), 1);
        let delivered: serde_json::Value = events[0].object.clone().into();
        assert_eq!(delivered["data"], "<redacted>");

        let (cached, is_sensitive) = cache
            .get(&ClusterId::new("c1"), &Gvr::new("", "v1", "secrets"), "default", "s")
            .unwrap()
            .unwrap();
        assert!(is_sensitive);
        let cached_json: serde_json::Value = cached.into();
        assert_eq!(cached_json["data"], "<redacted>");
    }

    /// IP-2, scenario 2: a Delete's own resource version (distinct from any
    /// preceding Modified) must still land in the Version Store.
    #[tokio::test]
    async fn delete_advances_the_version_store_with_its_own_resource_version() {
        let (ctx, _dir, _received) = context();
        let deleted = pod("p", "55", None);
        let stream = events_stream(vec![Ok(WatchEvent::Delete(deleted))]);
        let versions = ctx.versions.clone();
        drive(stream, ctx, connection().await, Duration::from_secs(30)).await;

        assert_eq!(versions.get("c1", "/v1/pods"), "55");
    }

    /// §4.4 point 4: if the informer's initial sync does not complete within
    /// the deadline, the cluster is marked `error` referencing the GVR but
    /// the Worker is left running and still delivers events that arrive later.
    #[tokio::test(start_paused = true)]
    async fn sync_timeout_marks_cluster_error_but_keeps_worker_running() {
        let (ctx, _dir, received) = context();
        let gvr = ctx.gvr.clone();
        let conn = connection().await;

        let late = pod("p", "1", None);
        let stream: std::pin::Pin<Box<dyn futures::Stream<Item = watcher::Result<WatchEvent<DynamicObject>>>>> =
            Box::pin(futures::stream::once(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(WatchEvent::Apply(late))
            }));

        drive(stream, ctx, conn.clone(), Duration::from_millis(10)).await;

        assert_eq!(conn.status(), Some(ClusterStatus::Error));
        assert!(conn.last_error().unwrap_or_default().contains(&gvr.to_key()));
        assert_eq!(received.lock().len(), 1);
    }
}
