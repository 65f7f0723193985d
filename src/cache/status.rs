use crate::cache::watch::Watch;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Per-group bookkeeping: the open watches for a node group and the last
/// time a watch request arrived. Used for safe snapshot eviction and
/// introspection.
#[derive(Debug)]
pub struct StatusInfo {
    node_group: String,
    watches: Mutex<HashMap<u64, Arc<Watch>>>,
    last_watch_request_time: Mutex<Option<Instant>>,
}

impl StatusInfo {
    pub(crate) fn new(node_group: String) -> Self {
        Self {
            node_group,
            watches: Mutex::new(HashMap::new()),
            last_watch_request_time: Mutex::new(None),
        }
    }

    pub fn node_group(&self) -> &str {
        &self.node_group
    }

    pub fn num_watches(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn watch_ids(&self) -> Vec<u64> {
        self.watches.lock().keys().copied().collect()
    }

    pub fn last_watch_request_time(&self) -> Option<Instant> {
        *self.last_watch_request_time.lock()
    }

    pub(crate) fn set_last_watch_request_time(&self, time: Instant) {
        *self.last_watch_request_time.lock() = Some(time);
    }

    pub(crate) fn set_watch(&self, watch_id: u64, watch: Arc<Watch>) {
        self.watches.lock().insert(watch_id, watch);
    }

    pub(crate) fn remove_watch(&self, watch_id: u64) {
        self.watches.lock().remove(&watch_id);
    }

    /// Removes and returns every watch matching `filter`. The lock is held
    /// only for the scan, so the caller can deliver responses to the removed
    /// watches without blocking concurrent watch creation.
    pub(crate) fn remove_if<F>(&self, mut filter: F) -> Vec<(u64, Arc<Watch>)>
    where
        F: FnMut(u64, &Watch) -> bool,
    {
        let mut watches = self.watches.lock();
        let stale: Vec<u64> = watches
            .iter()
            .filter(|(id, watch)| filter(**id, watch))
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| watches.remove(&id).map(|watch| (id, watch)))
            .collect()
    }
}
