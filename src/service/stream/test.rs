use super::*;
use crate::cache::{FetchError, WatchResponder};
use crate::snapshot::type_url::CLUSTER;
use async_trait::async_trait;
use data_plane_api::envoy::config::cluster::v3::Cluster;
use data_plane_api::envoy::service::discovery::v3::DiscoveryRequest;
use parking_lot::Mutex;

struct MockCache {
    inner: Mutex<InnerMockCache>,
}

struct InnerMockCache {
    create_watch_calls: Vec<(bool, DiscoveryRequest, HashSet<String>)>,
    watches: Vec<Arc<Watch>>,
}

#[async_trait]
impl Cache for MockCache {
    async fn create_watch(
        &self,
        ads: bool,
        req: &DiscoveryRequest,
        known_resource_names: &HashSet<String>,
        tx: WatchResponder,
    ) -> Arc<Watch> {
        let watch = Watch::new(ads, req.clone(), tx);
        let mut inner = self.inner.lock();
        inner
            .create_watch_calls
            .push((ads, req.clone(), known_resource_names.clone()));
        inner.watches.push(watch.clone());
        watch
    }

    async fn fetch<'a>(
        &'a self,
        _req: &'a DiscoveryRequest,
        _type_url: &'static str,
    ) -> Result<DiscoveryResponse, FetchError> {
        unimplemented!()
    }
}

impl MockCache {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(InnerMockCache {
                create_watch_calls: Vec::new(),
                watches: Vec::new(),
            }),
        })
    }

    fn call_count(&self) -> usize {
        self.inner.lock().create_watch_calls.len()
    }

    fn watch(&self, index: usize) -> Arc<Watch> {
        self.inner.lock().watches[index].clone()
    }
}

struct Harness {
    stream: Stream<MockCache>,
    cache: Arc<MockCache>,
    responses_rx: mpsc::Receiver<Result<DiscoveryResponse, Status>>,
}

fn harness(type_url: &'static str) -> Harness {
    let cache = MockCache::new();
    let (responses_tx, responses_rx) = mpsc::channel(8);
    let (watches_tx, _watches_rx) = mpsc::channel(8);
    let stream = Stream::new(responses_tx, watches_tx, type_url, cache.clone(), 1, None);
    Harness {
        stream,
        cache,
        responses_rx,
    }
}

fn cluster_request(nonce: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        type_url: CLUSTER.to_string(),
        response_nonce: nonce.to_string(),
        ..DiscoveryRequest::default()
    }
}

fn cluster_response(names: &[&str]) -> Response {
    Response {
        req: cluster_request(""),
        resources: names
            .iter()
            .map(|name| {
                crate::snapshot::resource::Resource::Cluster(Cluster {
                    name: name.to_string(),
                    ..Cluster::default()
                })
            })
            .collect(),
        version: "v1".to_string(),
    }
}

#[tokio::test]
async fn stream_stores_node_for_future_requests() {
    let mut h = harness(CLUSTER);
    let req_with_node = DiscoveryRequest {
        node: Some(Node {
            id: "foobar".to_string(),
            ..Node::default()
        }),
        ..DiscoveryRequest::default()
    };
    let req_without_node = DiscoveryRequest::default();
    h.stream.handle_client_request(req_with_node).await.unwrap();
    h.stream
        .handle_client_request(req_without_node)
        .await
        .unwrap();
    let inner = h.cache.inner.lock();
    let nodes: Vec<Option<Node>> = inner
        .create_watch_calls
        .iter()
        .map(|(_, req, _)| req.node.clone())
        .collect();
    assert_eq!(
        nodes,
        vec![
            Some(Node {
                id: "foobar".to_string(),
                ..Node::default()
            }),
            Some(Node {
                id: "foobar".to_string(),
                ..Node::default()
            }),
        ]
    );
}

#[tokio::test]
async fn empty_type_url_defaults_to_the_stream_type() {
    let mut h = harness(CLUSTER);
    h.stream
        .handle_client_request(DiscoveryRequest::default())
        .await
        .unwrap();
    let inner = h.cache.inner.lock();
    assert_eq!(inner.create_watch_calls[0].1.type_url, CLUSTER);
    assert!(!inner.create_watch_calls[0].0);
}

#[tokio::test]
async fn ads_rejects_requests_without_a_type_url() {
    let mut h = harness(ANY_TYPE);
    let status = h
        .stream
        .handle_client_request(DiscoveryRequest::default())
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(h.cache.call_count(), 0);
}

#[tokio::test]
async fn ads_passes_the_aggregated_flag_to_the_cache() {
    let mut h = harness(ANY_TYPE);
    h.stream
        .handle_client_request(cluster_request(""))
        .await
        .unwrap();
    assert!(h.cache.inner.lock().create_watch_calls[0].0);
}

#[tokio::test]
async fn stale_nonce_requests_are_discarded() {
    let mut h = harness(CLUSTER);
    h.stream
        .handle_client_request(cluster_request(""))
        .await
        .unwrap();
    assert_eq!(h.cache.call_count(), 1);

    // Deliver a response; the stream assigns nonce "1".
    h.stream.handle_watch_response(cluster_response(&[])).await;

    // A request referring to some other nonce is stale and ignored.
    h.stream
        .handle_client_request(cluster_request("999"))
        .await
        .unwrap();
    assert_eq!(h.cache.call_count(), 1);

    // The matching nonce gets through.
    h.stream
        .handle_client_request(cluster_request("1"))
        .await
        .unwrap();
    assert_eq!(h.cache.call_count(), 2);
}

#[tokio::test]
async fn ack_records_the_last_responses_resource_names() {
    let mut h = harness(CLUSTER);
    h.stream
        .handle_client_request(cluster_request(""))
        .await
        .unwrap();
    h.stream
        .handle_watch_response(cluster_response(&["cluster0"]))
        .await;

    h.stream
        .handle_client_request(cluster_request("1"))
        .await
        .unwrap();
    let inner = h.cache.inner.lock();
    assert_eq!(
        inner.create_watch_calls[1].2,
        HashSet::from(["cluster0".to_string()])
    );
}

#[tokio::test]
async fn nack_does_not_update_acked_resources() {
    let mut h = harness(CLUSTER);
    h.stream
        .handle_client_request(cluster_request(""))
        .await
        .unwrap();
    h.stream
        .handle_watch_response(cluster_response(&["cluster0"]))
        .await;

    let mut nack = cluster_request("1");
    nack.error_detail = Some(data_plane_api::google::rpc::Status {
        code: 13,
        message: "rejected".to_string(),
        details: Vec::new(),
    });
    h.stream.handle_client_request(nack).await.unwrap();
    let inner = h.cache.inner.lock();
    assert!(inner.create_watch_calls[1].2.is_empty());
}

#[tokio::test]
async fn superseding_request_cancels_the_previous_watch() {
    let mut h = harness(CLUSTER);
    h.stream
        .handle_client_request(cluster_request(""))
        .await
        .unwrap();
    let first = h.cache.watch(0);
    assert!(!first.is_cancelled());

    h.stream
        .handle_client_request(cluster_request(""))
        .await
        .unwrap();
    assert!(first.is_cancelled());
    assert!(!h.cache.watch(1).is_cancelled());
}

#[tokio::test]
async fn responses_carry_incrementing_nonces() {
    let mut h = harness(CLUSTER);
    h.stream
        .handle_watch_response(cluster_response(&["cluster0"]))
        .await;
    h.stream.handle_watch_response(cluster_response(&[])).await;

    let first = h.responses_rx.recv().await.unwrap().unwrap();
    assert_eq!(first.nonce, "1");
    assert_eq!(first.type_url, CLUSTER);
    assert_eq!(first.version_info, "v1");
    assert_eq!(first.resources.len(), 1);

    let second = h.responses_rx.recv().await.unwrap().unwrap();
    assert_eq!(second.nonce, "2");
}

#[tokio::test]
async fn close_cancels_all_active_watches() {
    let mut h = harness(ANY_TYPE);
    h.stream
        .handle_client_request(cluster_request(""))
        .await
        .unwrap();
    let watch = h.cache.watch(0);
    h.stream.close(None).await;
    assert!(watch.is_cancelled());
}
