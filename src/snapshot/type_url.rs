macro_rules! prefix {
    ($type:literal) => {
        concat!("type.googleapis.com/", $type)
    };
}

pub const CLUSTER: &'static str = prefix!("envoy.config.cluster.v3.Cluster");
pub const ENDPOINT: &'static str = prefix!("envoy.config.endpoint.v3.ClusterLoadAssignment");
pub const LISTENER: &'static str = prefix!("envoy.config.listener.v3.Listener");
pub const ROUTE: &'static str = prefix!("envoy.config.route.v3.RouteConfiguration");
pub const SECRET: &'static str = prefix!("envoy.extensions.transport_sockets.tls.v3.Secret");

/// Default type URL of an aggregated (ADS) stream: requests must self-declare
/// their type, so the stream itself carries no fixed type.
pub const ANY_TYPE: &'static str = "";

/// All resource types served by the cache.
pub const TYPE_URLS: [&'static str; 5] = [CLUSTER, ENDPOINT, LISTENER, ROUTE, SECRET];

/// Strips the well-known prefix for log readability.
pub fn shorten(type_url: &str) -> &str {
    type_url
        .strip_prefix("type.googleapis.com/")
        .unwrap_or(type_url)
}
