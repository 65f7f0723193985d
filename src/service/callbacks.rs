use data_plane_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tonic::Status;

/// Application-specific hooks into the lifecycle of discovery streams, for
/// logs and metrics. All methods default to no-ops and are invoked
/// synchronously inline; implementations must not panic, as they run on the
/// stream's own task.
///
/// `type_url` is the resource type of the stream, or
/// [`crate::snapshot::type_url::ANY_TYPE`] for ADS.
pub trait Callbacks: Send + Sync + 'static {
    /// Called when a bi-directional stream is opened, before the first
    /// request is processed.
    fn on_stream_open(&self, _stream_id: i64, _type_url: &str) {}

    /// Called just before a stream is closed successfully.
    fn on_stream_close(&self, _stream_id: i64, _type_url: &str) {}

    /// Called just before a stream is closed due to an error.
    fn on_stream_close_with_error(&self, _stream_id: i64, _type_url: &str, _error: &Status) {}

    /// Called for each request received on a stream.
    fn on_stream_request(&self, _stream_id: i64, _req: &DiscoveryRequest) {}

    /// Called just before each response is written to a stream.
    fn on_stream_response(
        &self,
        _stream_id: i64,
        _req: &DiscoveryRequest,
        _rep: &DiscoveryResponse,
    ) {
    }
}
