use crate::snapshot::type_url;
use data_plane_api::envoy::config::cluster::v3::{cluster, Cluster};
use data_plane_api::envoy::config::endpoint::v3::ClusterLoadAssignment;
use data_plane_api::envoy::config::listener::v3::{filter, Listener};
use data_plane_api::envoy::config::route::v3::RouteConfiguration;
use data_plane_api::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, HttpConnectionManager,
};
use data_plane_api::envoy::extensions::transport_sockets::tls::v3::Secret;
use data_plane_api::google::protobuf::Any;
use prost::Message;
use std::collections::HashSet;
use tracing::warn;

/// Well-known name of the HTTP connection manager network filter, inspected
/// when extracting route-config references from listeners.
pub const FILTER_HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("cannot unpack non-xDS message type: {0}")]
    UnknownTypeUrl(String),
    #[error("failed to unpack {type_url}")]
    Unpack {
        type_url: String,
        source: prost::DecodeError,
    },
}

/// One typed xDS resource. The set of kinds is closed, so dispatch over the
/// catalog is exhaustive and compiler-checked.
#[derive(Debug, Clone)]
pub enum Resource {
    Cluster(Cluster),
    Endpoint(ClusterLoadAssignment),
    Listener(Listener),
    Route(RouteConfiguration),
    Secret(Secret),
}

impl Resource {
    /// The name that uniquely identifies this resource within its type.
    pub fn name(&self) -> &str {
        match self {
            Resource::Cluster(cluster) => &cluster.name,
            Resource::Endpoint(endpoint) => &endpoint.cluster_name,
            Resource::Listener(listener) => &listener.name,
            Resource::Route(route) => &route.name,
            Resource::Secret(secret) => &secret.name,
        }
    }

    pub fn type_url(&self) -> &'static str {
        match self {
            Resource::Cluster(_) => type_url::CLUSTER,
            Resource::Endpoint(_) => type_url::ENDPOINT,
            Resource::Listener(_) => type_url::LISTENER,
            Resource::Route(_) => type_url::ROUTE,
            Resource::Secret(_) => type_url::SECRET,
        }
    }

    pub fn into_any(&self) -> Any {
        let value = match self {
            Resource::Cluster(cluster) => cluster.encode_to_vec(),
            Resource::Endpoint(endpoint) => endpoint.encode_to_vec(),
            Resource::Listener(listener) => listener.encode_to_vec(),
            Resource::Route(route) => route.encode_to_vec(),
            Resource::Secret(secret) => secret.encode_to_vec(),
        };
        Any {
            type_url: self.type_url().to_string(),
            value,
        }
    }

    /// Unpacks a type-tagged envelope into a typed resource. Fails if the
    /// type URL is not one of the five known kinds, or if the payload does
    /// not decode as that kind.
    pub fn from_any(any: &Any) -> Result<Resource, ResourceError> {
        let unpack = |source| ResourceError::Unpack {
            type_url: any.type_url.clone(),
            source,
        };
        match any.type_url.as_str() {
            type_url::CLUSTER => Cluster::decode(any.value.as_slice())
                .map(Resource::Cluster)
                .map_err(unpack),
            type_url::ENDPOINT => ClusterLoadAssignment::decode(any.value.as_slice())
                .map(Resource::Endpoint)
                .map_err(unpack),
            type_url::LISTENER => Listener::decode(any.value.as_slice())
                .map(Resource::Listener)
                .map_err(unpack),
            type_url::ROUTE => RouteConfiguration::decode(any.value.as_slice())
                .map(Resource::Route)
                .map_err(unpack),
            type_url::SECRET => Secret::decode(any.value.as_slice())
                .map(Resource::Secret)
                .map_err(unpack),
            other => Err(ResourceError::UnknownTypeUrl(other.to_string())),
        }
    }

    /// Resolves an envelope's concrete kind and returns its resource name.
    pub fn name_of_any(any: &Any) -> Result<String, ResourceError> {
        Ok(Resource::from_any(any)?.name().to_string())
    }
}

/// Names of resources of a *different* type referenced by the given
/// resources: EDS service names for dynamically-discovered clusters, and
/// route-config names embedded in listener HTTP connection managers.
///
/// Endpoints, routes and secrets contribute nothing. References to clusters
/// from routes and listeners are not included because clusters are fetched
/// in bulk, not by name.
pub fn resource_references<'a, I>(resources: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a Resource>,
{
    let mut refs = HashSet::new();
    for resource in resources {
        match resource {
            Resource::Endpoint(_) | Resource::Route(_) | Resource::Secret(_) => {}
            Resource::Cluster(cluster) => collect_cluster_references(cluster, &mut refs),
            Resource::Listener(listener) => collect_listener_references(listener, &mut refs),
        }
    }
    refs
}

// For EDS clusters, the endpoint assignment is looked up under the service
// name override when present, otherwise under the cluster's own name.
fn collect_cluster_references(cluster: &Cluster, refs: &mut HashSet<String>) {
    let discovery_type = match cluster.cluster_discovery_type {
        Some(cluster::ClusterDiscoveryType::Type(discovery_type)) => discovery_type,
        _ => return,
    };
    if discovery_type != cluster::DiscoveryType::Eds as i32 {
        return;
    }
    match &cluster.eds_cluster_config {
        Some(config) if !config.service_name.is_empty() => {
            refs.insert(config.service_name.clone());
        }
        _ => {
            refs.insert(cluster.name.clone());
        }
    }
}

fn collect_listener_references(listener: &Listener, refs: &mut HashSet<String>) {
    for chain in &listener.filter_chains {
        for filter in &chain.filters {
            if filter.name != FILTER_HTTP_CONNECTION_MANAGER {
                continue;
            }
            let any = match &filter.config_type {
                Some(filter::ConfigType::TypedConfig(any)) => any,
                _ => continue,
            };
            // Malformed filter configs are skipped rather than failing the
            // whole reference computation.
            let manager = match HttpConnectionManager::decode(any.value.as_slice()) {
                Ok(manager) => manager,
                Err(error) => {
                    warn!(
                        "failed to decode http connection manager config for listener {}: {}",
                        listener.name, error
                    );
                    continue;
                }
            };
            if let Some(http_connection_manager::RouteSpecifier::Rds(rds)) =
                &manager.route_specifier
            {
                if !rds.route_config_name.is_empty() {
                    refs.insert(rds.route_config_name.clone());
                }
            }
        }
    }
}
