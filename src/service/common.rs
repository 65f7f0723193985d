use crate::cache::{Cache, FetchError};
use crate::service::callbacks::Callbacks;
use crate::service::stream::handle_stream;
use data_plane_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response};
use tonic::{Status, Streaming};

/// Shared state behind every discovery endpoint: the cache plus optional
/// lifecycle callbacks. One instance serves all resource types.
pub struct Service<C: Cache> {
    cache: Arc<C>,
    callbacks: Option<Arc<dyn Callbacks>>,
    stream_count: AtomicI64,
}

pub type StreamResponse<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

impl<C: Cache> Service<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self {
            cache,
            callbacks: None,
            stream_count: AtomicI64::new(0),
        }
    }

    pub fn with_callbacks(cache: Arc<C>, callbacks: Arc<dyn Callbacks>) -> Self {
        Self {
            cache,
            callbacks: Some(callbacks),
            stream_count: AtomicI64::new(0),
        }
    }

    pub fn stream(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
        type_url: &'static str,
    ) -> Result<Response<StreamResponse<DiscoveryResponse>>, Status> {
        let stream_id = self.stream_count.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(callbacks) = &self.callbacks {
            callbacks.on_stream_open(stream_id, type_url);
        }
        let input = req.into_inner();
        let (tx, rx) = mpsc::channel(1);
        let output = ReceiverStream::new(rx);
        let cache = self.cache.clone();
        let callbacks = self.callbacks.clone();
        tokio::spawn(
            async move { handle_stream(input, tx, type_url, cache, stream_id, callbacks).await },
        );
        Ok(Response::new(
            Box::pin(output) as StreamResponse<DiscoveryResponse>
        ))
    }

    pub async fn fetch(
        &self,
        req: &DiscoveryRequest,
        type_url: &'static str,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        match self.cache.fetch(req, type_url).await {
            Ok(resp) => Ok(Response::new(resp)),
            Err(FetchError::NotFound) => Err(Status::not_found("Resource not found for node")),
            Err(FetchError::VersionUpToDate) => {
                Err(Status::already_exists("Version already up to date"))
            }
        }
    }
}
