use crate::cache::watch::Watch;
use crate::cache::{Cache, Response};
use crate::service::callbacks::Callbacks;
use crate::snapshot::type_url::{self, ANY_TYPE};
use data_plane_api::envoy::config::core::v3::Node;
use data_plane_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::{Status, Streaming};
use tracing::{debug, info_span, Instrument};

/// Pumps one client's bi-directional discovery stream: requests in, watch
/// responses out, until the client disconnects or a protocol error ends the
/// stream.
pub async fn handle_stream<C: Cache>(
    mut requests: Streaming<DiscoveryRequest>,
    responses: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    type_url: &'static str,
    cache: Arc<C>,
    stream_id: i64,
    callbacks: Option<Arc<dyn Callbacks>>,
) {
    let (watches_tx, mut watches_rx) = mpsc::channel(16);
    let mut stream = Stream::new(responses, watches_tx, type_url, cache, stream_id, callbacks);
    let error = loop {
        tokio::select! {
            maybe_req = requests.next() => {
                match maybe_req {
                    Some(Ok(req)) => {
                        let span = stream.build_client_request_span(&req);
                        if let Err(status) = stream.handle_client_request(req).instrument(span).await {
                            break Some(status);
                        }
                    }
                    Some(Err(status)) => break Some(status),
                    None => break None,
                }
            }
            Some(rep) = watches_rx.recv() => {
                stream.handle_watch_response(rep).await;
            }
        }
    };
    stream.close(error).await;
}

struct LastResponse {
    nonce: String,
    resource_names: Vec<String>,
}

struct Stream<C: Cache> {
    responses: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    watches_tx: mpsc::Sender<Response>,
    type_url: &'static str,
    ads: bool,
    cache: Arc<C>,
    stream_id: i64,
    nonce: i64,
    node: Option<Node>,
    // One active watch, last response and acked set per type URL. A
    // single-type stream only ever populates one key; an ADS stream serves
    // all types concurrently. All three maps are touched only from this
    // stream's own task, watch deliveries included, so the nonce a racing
    // ACK compares against is always the one recorded before the write.
    active_watches: HashMap<String, Arc<Watch>>,
    last_responses: HashMap<String, LastResponse>,
    acked_resources: HashMap<String, HashSet<String>>,
    callbacks: Option<Arc<dyn Callbacks>>,
}

impl<C: Cache> Stream<C> {
    fn new(
        responses: mpsc::Sender<Result<DiscoveryResponse, Status>>,
        watches_tx: mpsc::Sender<Response>,
        type_url: &'static str,
        cache: Arc<C>,
        stream_id: i64,
        callbacks: Option<Arc<dyn Callbacks>>,
    ) -> Self {
        Self {
            responses,
            watches_tx,
            type_url,
            ads: type_url == ANY_TYPE,
            cache,
            stream_id,
            nonce: 0,
            node: None,
            active_watches: HashMap::new(),
            last_responses: HashMap::new(),
            acked_resources: HashMap::new(),
            callbacks,
        }
    }

    async fn handle_client_request(&mut self, mut req: DiscoveryRequest) -> Result<(), Status> {
        if let Some(callbacks) = &self.callbacks {
            callbacks.on_stream_request(self.stream_id, &req);
        }

        // Node might only be sent on the first request to save sending the
        // same data repeatedly, so let's cache it in memory for future
        // requests on this stream.
        if req.node.is_some() {
            self.node = req.node.clone();
        } else {
            req.node = self.node.clone();
        }

        if self.ads && req.type_url.is_empty() {
            // Type URL is required for ADS because we can't tell from just
            // the gRPC method which resource this request is for.
            return Err(Status::invalid_argument("type URL is required for ADS"));
        } else if req.type_url.is_empty() {
            // Type URL is otherwise optional, but let's set it for
            // consistency.
            req.type_url = self.type_url.to_string();
        }

        // A nonce that doesn't match the last response sent for this type
        // refers to a response the client has since superseded; ignore the
        // request rather than churn the watch.
        if let Some(last) = self.last_responses.get(&req.type_url) {
            if !last.nonce.is_empty()
                && !req.response_nonce.is_empty()
                && last.nonce != req.response_nonce
            {
                debug!(
                    "ignoring stale request with nonce {} (latest is {})",
                    req.response_nonce, last.nonce
                );
                return Ok(());
            }

            // An ACK (no error detail) means the client holds everything the
            // last response carried; remember those names for the cache's
            // new-resource check.
            if req.error_detail.is_none() {
                self.acked_resources.insert(
                    req.type_url.clone(),
                    last.resource_names.iter().cloned().collect(),
                );
            }
        }

        // A second request for the same type supersedes the first: the old
        // watch must never deliver.
        if let Some(old) = self.active_watches.remove(&req.type_url) {
            old.cancel();
        }

        let known = self
            .acked_resources
            .get(&req.type_url)
            .cloned()
            .unwrap_or_default();
        let type_url = req.type_url.clone();
        let watch = self
            .cache
            .create_watch(self.ads, &req, &known, self.watches_tx.clone())
            .await;
        self.active_watches.insert(type_url, watch);
        Ok(())
    }

    async fn handle_watch_response(&mut self, rep: Response) {
        self.nonce += 1;
        let nonce = self.nonce.to_string();
        let discovery = DiscoveryResponse {
            version_info: rep.version,
            type_url: rep.req.type_url.clone(),
            nonce: nonce.clone(),
            resources: rep
                .resources
                .iter()
                .map(|resource| resource.into_any())
                .collect(),
            control_plane: None,
            canary: false,
        };
        debug!(
            "response {} with nonce {} version {}",
            type_url::shorten(&discovery.type_url),
            nonce,
            discovery.version_info
        );

        // Store the latest response before writing it: a client re-request
        // racing the write must observe the new nonce, or its ACK would be
        // misjudged as stale.
        let resource_names = rep
            .resources
            .iter()
            .map(|resource| resource.name().to_string())
            .collect();
        self.last_responses.insert(
            rep.req.type_url.clone(),
            LastResponse {
                nonce,
                resource_names,
            },
        );

        if let Some(callbacks) = &self.callbacks {
            callbacks.on_stream_response(self.stream_id, &rep.req, &discovery);
        }

        // A failed send means the client is gone; the request side of the
        // loop will observe the close and tear the stream down.
        let _ = self.responses.send(Ok(discovery)).await;
    }

    async fn close(&mut self, error: Option<Status>) {
        for (_, watch) in self.active_watches.drain() {
            watch.cancel();
        }
        match error {
            Some(status) => {
                debug!("stream {} closed with error: {}", self.stream_id, status);
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_stream_close_with_error(self.stream_id, self.type_url, &status);
                }
                let _ = self.responses.send(Err(status)).await;
            }
            None => {
                debug!("stream {} closed", self.stream_id);
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_stream_close(self.stream_id, self.type_url);
                }
            }
        }
    }

    fn build_client_request_span(&self, req: &DiscoveryRequest) -> tracing::Span {
        info_span!(
            "handle_client_request",
            stream_id = self.stream_id,
            type_url = type_url::shorten(&req.type_url),
            response_nonce = %req.response_nonce,
        )
    }
}

#[cfg(test)]
mod test;
