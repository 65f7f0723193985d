pub mod snapshot;
pub mod status;
pub mod watch;

use crate::snapshot::resource::Resource;
use async_trait::async_trait;
use data_plane_api::envoy::config::core::v3::Node;
use data_plane_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use watch::Watch;

/// One watch delivery: the originating request together with the resources
/// and version that satisfy it. The stream handler turns this into a
/// `DiscoveryResponse` once it has assigned a nonce.
#[derive(Debug, Clone)]
pub struct Response {
    pub req: DiscoveryRequest,
    pub resources: Vec<Resource>,
    pub version: String,
}

pub type WatchResponder = mpsc::Sender<Response>;

pub enum FetchError {
    VersionUpToDate,
    NotFound,
}

/// Maps a client's node identity to the group key under which its snapshot
/// and watches are maintained. Supplied by the embedding application.
pub trait NodeHash: Send + Sync + 'static {
    fn hash(&self, node: Option<&Node>) -> String;
}

/// Groups nodes by their id field.
pub struct IdHash;

impl NodeHash for IdHash {
    fn hash(&self, node: Option<&Node>) -> String {
        node.map_or_else(String::new, |node| node.id.clone())
    }
}

#[async_trait]
pub trait Cache: Sync + Send + 'static {
    /// Either responds on `tx` immediately or leaves an open watch; the
    /// returned watch is cancelled by the caller when it is superseded or
    /// the stream closes.
    ///
    /// `known_resource_names` holds the names the client has already ACKed
    /// for the request's type; requests naming resources outside this set
    /// may be answered immediately even without a version change.
    async fn create_watch(
        &self,
        ads: bool,
        req: &DiscoveryRequest,
        known_resource_names: &HashSet<String>,
        tx: WatchResponder,
    ) -> Arc<Watch>;

    async fn fetch<'a>(
        &'a self,
        req: &'a DiscoveryRequest,
        type_url: &'static str,
    ) -> Result<DiscoveryResponse, FetchError>;
}
