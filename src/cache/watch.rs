use crate::cache::{Response, WatchResponder};
use data_plane_api::envoy::service::discovery::v3::DiscoveryRequest;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Attempted to deliver to a watch that has already been cancelled or has
/// already delivered its one response.
#[derive(Debug, thiserror::Error)]
#[error("watch has already been cancelled")]
pub struct WatchCancelled;

type StopFn = Box<dyn FnOnce() + Send>;

/// A single pending request's continuation.
///
/// A watch is one-shot: at most one of {deliver, cancel} ever wins, enforced
/// by a single atomically-swapped flag. After delivering, the cache discards
/// it and expects the client to issue a fresh request that creates a new
/// watch.
pub struct Watch {
    ads: bool,
    req: DiscoveryRequest,
    tx: WatchResponder,
    done: AtomicBool,
    stop: Mutex<Option<StopFn>>,
}

impl Watch {
    pub(crate) fn new(ads: bool, req: DiscoveryRequest, tx: WatchResponder) -> Arc<Self> {
        Arc::new(Self {
            ads,
            req,
            tx,
            done: AtomicBool::new(false),
            stop: Mutex::new(None),
        })
    }

    pub fn is_ads(&self) -> bool {
        self.ads
    }

    pub fn request(&self) -> &DiscoveryRequest {
        &self.req
    }

    pub fn is_cancelled(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Idempotent and safe to race with a concurrent delivery attempt; the
    /// on-stop hook fires exactly once, on the invocation that wins the flag.
    pub fn cancel(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            if let Some(stop) = self.stop.lock().take() {
                stop();
            }
        }
    }

    /// Registered by the cache at the moment the watch is parked, to remove
    /// the watch from its group's registry on cancellation.
    pub(crate) fn set_stop(&self, stop: impl FnOnce() + Send + 'static) {
        *self.stop.lock() = Some(Box::new(stop));
    }

    /// Delivers the response, claiming the one-shot flag first so a racing
    /// cancellation can never interleave with a delivery.
    pub(crate) async fn respond(&self, response: Response) -> Result<(), WatchCancelled> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(WatchCancelled);
        }
        // A dropped receiver means the stream is gone, which is equivalent
        // to cancellation from the cache's point of view.
        self.tx.send(response).await.map_err(|_| WatchCancelled)
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("ads", &self.ads)
            .field("type_url", &self.req.type_url)
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn new_watch(capacity: usize) -> (Arc<Watch>, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Watch::new(false, DiscoveryRequest::default(), tx), rx)
    }

    fn response() -> Response {
        Response {
            req: DiscoveryRequest::default(),
            resources: Vec::new(),
            version: "v1".to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_at_most_once() {
        let (watch, mut rx) = new_watch(2);
        watch.respond(response()).await.unwrap();
        assert!(watch.respond(response()).await.is_err());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn respond_after_cancel_is_an_error() {
        let (watch, _rx) = new_watch(1);
        watch.cancel();
        assert!(watch.is_cancelled());
        assert!(watch.respond(response()).await.is_err());
    }

    #[test]
    fn stop_hook_fires_exactly_once() {
        let (tx, _rx) = mpsc::channel(1);
        let watch = Watch::new(false, DiscoveryRequest::default(), tx);
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        watch.set_stop(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        watch.cancel();
        watch.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_hook_does_not_fire_after_delivery() {
        let (watch, _rx) = new_watch(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        watch.set_stop(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        watch.respond(response()).await.unwrap();
        watch.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
