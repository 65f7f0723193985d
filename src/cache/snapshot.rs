use crate::cache::status::StatusInfo;
use crate::cache::watch::Watch;
use crate::cache::{Cache, FetchError, NodeHash, Response, WatchResponder};
use crate::snapshot::resource::Resource;
use crate::snapshot::{Snapshot, SnapshotResources};
use async_trait::async_trait;
use dashmap::DashMap;
use data_plane_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// The central store mapping node group to its current snapshot and open
/// watches.
///
/// Watch creation takes the snapshot table's read lock so that watches can
/// be created in parallel; snapshot replacement and eviction take the write
/// lock. A watch created concurrently with `set_snapshot` is therefore
/// always registered against the snapshot in effect just before or just
/// after the update, never a torn view.
pub struct SnapshotCache {
    snapshots: RwLock<HashMap<String, Snapshot>>,
    statuses: DashMap<String, Arc<StatusInfo>>,
    watch_count: AtomicU64,
    hash: Arc<dyn NodeHash>,
}

impl SnapshotCache {
    pub fn new(hash: Arc<dyn NodeHash>) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            statuses: DashMap::new(),
            watch_count: AtomicU64::new(0),
            hash,
        }
    }

    /// Replaces the snapshot for a group so that future requests receive it,
    /// then drains any open watch whose effective version the new snapshot
    /// makes stale. Watches at the new version stay parked.
    pub async fn set_snapshot(&self, group: &str, snapshot: Snapshot) {
        {
            let mut snapshots = self.snapshots.write().await;
            snapshots.insert(group.to_string(), snapshot.clone());
        }

        let status = match self.statuses.get(group) {
            Some(status) => status.clone(),
            None => return,
        };

        // Compare-and-respond sweep, outside the exclusive lock: only
        // watches whose requested version differs under the new snapshot are
        // drained. Each is removed first so it can never deliver twice.
        let stale = status.remove_if(|_, watch| {
            let req = watch.request();
            snapshot.version(&req.type_url, &req.resource_names) != req.version_info
        });
        for (watch_id, watch) in stale {
            let req = watch.request();
            debug!(
                "responding to open watch {}[{}] with new version {}",
                watch_id,
                req.resource_names.join(", "),
                snapshot.version(&req.type_url, &req.resource_names),
            );
            self.respond(&watch, &snapshot, group).await;
        }
    }

    pub async fn get_snapshot(&self, group: &str) -> Option<Snapshot> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(group).cloned()
    }

    /// Fails if the group still has open watches: a snapshot with active
    /// listeners must not be evicted out from under them.
    pub async fn clear_snapshot(&self, group: &str) -> bool {
        let mut snapshots = self.snapshots.write().await;
        if let Some(status) = self.statuses.get(group) {
            if status.num_watches() > 0 {
                warn!(
                    "tried to clear snapshot for group with existing watches, group={}",
                    group
                );
                return false;
            }
        }
        self.statuses.remove(group);
        snapshots.remove(group);
        true
    }

    pub fn status_info(&self, group: &str) -> Option<Arc<StatusInfo>> {
        self.statuses.get(group).map(|status| status.clone())
    }

    pub fn groups(&self) -> Vec<String> {
        self.statuses
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Delivers the watch's filtered view of `snapshot`, unless the watch is
    /// aggregated and names a resource the snapshot does not hold: an ADS
    /// client must never receive a response it cannot validate dependency
    /// consistency for.
    async fn respond(&self, watch: &Watch, snapshot: &Snapshot, group: &str) -> bool {
        let req = watch.request();
        let resources = snapshot.resources(&req.type_url);

        if watch.is_ads() && !req.resource_names.is_empty() {
            let missing: Vec<&String> = req
                .resource_names
                .iter()
                .filter(|name| {
                    resources.map_or(true, |resources| !resources.items().contains_key(*name))
                })
                .collect();
            if !missing.is_empty() {
                info!(
                    "not responding in ADS mode for {} from node {} for request [{}] since [{}] not in snapshot",
                    req.type_url,
                    group,
                    req.resource_names.join(", "),
                    missing
                        .iter()
                        .map(|name| name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                );
                return false;
            }
        }

        let version = snapshot.version(&req.type_url, &req.resource_names);
        debug!(
            "responding for {} from node {} at version {} with version {}",
            req.type_url, group, req.version_info, version
        );

        let filtered = filter_resources(req, resources);
        let response = Response {
            req: req.clone(),
            resources: filtered,
            version,
        };
        match watch.respond(response).await {
            Ok(()) => true,
            Err(_) => {
                // Cancellation races are expected steady-state behavior.
                warn!(
                    "failed to respond for {} from node {} because watch was already cancelled",
                    req.type_url, group
                );
                false
            }
        }
    }

    fn park(&self, status: &Arc<StatusInfo>, watch: &Arc<Watch>, reason: &str) {
        let watch_id = self.watch_count.fetch_add(1, Ordering::Relaxed) + 1;
        let req = watch.request();
        debug!(
            "open watch {} for {}[{}] from node {} for version {}: {}",
            watch_id,
            req.type_url,
            req.resource_names.join(", "),
            status.node_group(),
            req.version_info,
            reason,
        );
        status.set_watch(watch_id, watch.clone());
        let registry = status.clone();
        watch.set_stop(move || registry.remove_watch(watch_id));
    }
}

#[async_trait]
impl Cache for SnapshotCache {
    async fn create_watch(
        &self,
        ads: bool,
        req: &DiscoveryRequest,
        known_resource_names: &HashSet<String>,
        tx: WatchResponder,
    ) -> Arc<Watch> {
        let group = self.hash.hash(req.node.as_ref());
        // A read lock suffices even though we are registering watches:
        // creations only add to concurrent registries, and must not exclude
        // each other. Only snapshot replacement and eviction are exclusive.
        let snapshots = self.snapshots.read().await;

        let status = self
            .statuses
            .entry(group.clone())
            .or_insert_with(|| Arc::new(StatusInfo::new(group.clone())))
            .clone();
        status.set_last_watch_request_time(Instant::now());

        let watch = Watch::new(ads, req.clone(), tx);
        let snapshot = snapshots.get(&group);
        let version = snapshot.map_or_else(String::new, |snapshot| {
            snapshot.version(&req.type_url, &req.resource_names)
        });

        if let Some(snapshot) = snapshot {
            // If the request names resources we haven't sent to the proxy
            // yet and any of them are in the snapshot, respond immediately
            // regardless of version so late-joining names don't wait for a
            // version bump.
            let new_hints: Vec<&String> = req
                .resource_names
                .iter()
                .filter(|name| !known_resource_names.contains(*name))
                .collect();
            if !new_hints.is_empty() {
                let present = snapshot.resources(&req.type_url).map_or(false, |resources| {
                    new_hints.iter().any(|name| resources.items().contains_key(*name))
                });
                if present {
                    debug!("responding: new resource hint");
                    // TODO: Don't hold the read lock across the send
                    // (performance).
                    self.respond(&watch, snapshot, &group).await;
                    return watch;
                }
            }
        }

        // The requested version is up to date, or there is nothing to
        // respond with yet; leave an open watch for the next change.
        let snapshot = match snapshot {
            Some(snapshot) if req.version_info != version => snapshot,
            _ => {
                self.park(&status, &watch, "latest version");
                return watch;
            }
        };

        // The version has changed; respond now unless the ADS consistency
        // rule withholds the response, in which case park as above.
        if !self.respond(&watch, snapshot, &group).await {
            self.park(&status, &watch, "immediate response withheld");
        }
        watch
    }

    async fn fetch<'a>(
        &'a self,
        req: &'a DiscoveryRequest,
        type_url: &'static str,
    ) -> Result<DiscoveryResponse, FetchError> {
        let group = self.hash.hash(req.node.as_ref());
        let snapshots = self.snapshots.read().await;
        let snapshot = snapshots.get(&group).ok_or(FetchError::NotFound)?;
        let version = snapshot.version(type_url, &req.resource_names);
        if req.version_info == version {
            return Err(FetchError::VersionUpToDate);
        }
        let resources = filter_resources(req, snapshot.resources(type_url));
        Ok(DiscoveryResponse {
            type_url: type_url.to_string(),
            nonce: String::new(),
            version_info: version,
            resources: resources.iter().map(|resource| resource.into_any()).collect(),
            control_plane: None,
            canary: false,
        })
    }
}

/// All resources when the request names none, otherwise only the named ones
/// that exist; absent names are ignored.
fn filter_resources(
    req: &DiscoveryRequest,
    resources: Option<&SnapshotResources>,
) -> Vec<Resource> {
    let resources = match resources {
        Some(resources) => resources,
        None => return Vec::new(),
    };
    if req.resource_names.is_empty() {
        resources.items().values().cloned().collect()
    } else {
        req.resource_names
            .iter()
            .filter_map(|name| resources.items().get(name).cloned())
            .collect()
    }
}
