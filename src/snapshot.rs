pub mod resource;
pub mod type_url;

use data_plane_api::envoy::config::cluster::v3::Cluster;
use data_plane_api::envoy::config::endpoint::v3::ClusterLoadAssignment;
use data_plane_api::envoy::config::listener::v3::Listener;
use data_plane_api::envoy::config::route::v3::RouteConfiguration;
use data_plane_api::envoy::extensions::transport_sockets::tls::v3::Secret;
use resource::{resource_references, Resource};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Resolves a requested subset of resource names to a version string.
///
/// A resolver backs either a single version for the whole set, or
/// per-resource versioning. A per-resource resolver must return a
/// distinguished aggregate version when given zero or more than one name, or
/// a name it does not recognize.
pub type VersionResolver = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

/// The named resources of one type within a snapshot, together with their
/// version resolver.
#[derive(Clone)]
pub struct SnapshotResources {
    items: HashMap<String, Resource>,
    resolver: VersionResolver,
}

impl SnapshotResources {
    /// A resource set with a single version for every resource.
    pub fn new(resources: Vec<Resource>, version: impl Into<String>) -> Self {
        let version = version.into();
        Self::with_resolver(resources, Arc::new(move |_| version.clone()))
    }

    /// A resource set with per-resource versioning delegated to `resolver`.
    pub fn with_resolver(resources: Vec<Resource>, resolver: VersionResolver) -> Self {
        let items = resources
            .into_iter()
            .map(|resource| (resource.name().to_string(), resource))
            .collect();
        Self { items, resolver }
    }

    pub fn items(&self) -> &HashMap<String, Resource> {
        &self.items
    }

    pub fn version(&self, resource_names: &[String]) -> String {
        (self.resolver)(resource_names)
    }
}

impl fmt::Debug for SnapshotResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotResources")
            .field("items", &self.items.keys())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotConsistencyError {
    #[error(
        "mismatched {parent_type_url} -> {dependency_type_url} reference and resource lengths, \
         [{references}] != {count}"
    )]
    CountMismatch {
        parent_type_url: &'static str,
        dependency_type_url: &'static str,
        references: String,
        count: usize,
    },
    #[error(
        "{dependency_type_url} named '{name}', referenced by a {parent_type_url}, \
         not listed in [{listed}]"
    )]
    MissingName {
        parent_type_url: &'static str,
        dependency_type_url: &'static str,
        name: String,
        listed: String,
    },
}

/// An immutable, versioned bundle of resource sets, one per resource type.
///
/// A snapshot is created whole and fully replaces the previous one for a node
/// group; it is never mutated after being handed to the cache.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    resources: HashMap<String, SnapshotResources>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot with one version shared by all five resource sets.
    pub fn with_version(
        clusters: Vec<Cluster>,
        endpoints: Vec<ClusterLoadAssignment>,
        listeners: Vec<Listener>,
        routes: Vec<RouteConfiguration>,
        secrets: Vec<Secret>,
        version: &str,
    ) -> Self {
        let mut snapshot = Self::new();
        snapshot.insert(
            type_url::CLUSTER,
            SnapshotResources::new(clusters.into_iter().map(Resource::Cluster).collect(), version),
        );
        snapshot.insert(
            type_url::ENDPOINT,
            SnapshotResources::new(
                endpoints.into_iter().map(Resource::Endpoint).collect(),
                version,
            ),
        );
        snapshot.insert(
            type_url::LISTENER,
            SnapshotResources::new(
                listeners.into_iter().map(Resource::Listener).collect(),
                version,
            ),
        );
        snapshot.insert(
            type_url::ROUTE,
            SnapshotResources::new(routes.into_iter().map(Resource::Route).collect(), version),
        );
        snapshot.insert(
            type_url::SECRET,
            SnapshotResources::new(secrets.into_iter().map(Resource::Secret).collect(), version),
        );
        snapshot
    }

    /// Sets the resource set for one type. Use this with
    /// [`SnapshotResources::new`] for per-set versions, or
    /// [`SnapshotResources::with_resolver`] for per-resource versioning.
    pub fn insert(&mut self, type_url: impl Into<String>, resources: SnapshotResources) {
        self.resources.insert(type_url.into(), resources);
    }

    pub fn resources(&self, type_url: &str) -> Option<&SnapshotResources> {
        self.resources.get(type_url)
    }

    /// The version for the requested names of one type. Empty string for an
    /// empty or unknown type URL.
    pub fn version(&self, type_url: &str, resource_names: &[String]) -> String {
        self.resources
            .get(type_url)
            .map_or_else(String::new, |resources| resources.version(resource_names))
    }

    /// Verifies that every dependency reference resolves: the EDS service
    /// names referenced by clusters must exactly match the endpoint set, and
    /// the route-config names referenced by listeners must exactly match the
    /// route set. Not invoked automatically; producers building snapshots
    /// from derived state should call this before publishing.
    pub fn ensure_consistent(&self) -> Result<(), SnapshotConsistencyError> {
        let cluster_refs = self.references_of(type_url::CLUSTER);
        self.ensure_all_resource_names_exist(type_url::CLUSTER, type_url::ENDPOINT, &cluster_refs)?;

        let listener_refs = self.references_of(type_url::LISTENER);
        self.ensure_all_resource_names_exist(type_url::LISTENER, type_url::ROUTE, &listener_refs)?;

        Ok(())
    }

    fn references_of(&self, type_url: &str) -> Vec<String> {
        let mut refs: Vec<String> = self
            .resources
            .get(type_url)
            .map(|resources| resource_references(resources.items.values()))
            .unwrap_or_default()
            .into_iter()
            .collect();
        refs.sort();
        refs
    }

    fn ensure_all_resource_names_exist(
        &self,
        parent_type_url: &'static str,
        dependency_type_url: &'static str,
        references: &[String],
    ) -> Result<(), SnapshotConsistencyError> {
        let empty = HashMap::new();
        let dependencies = self
            .resources
            .get(dependency_type_url)
            .map_or(&empty, |resources| &resources.items);

        if references.len() != dependencies.len() {
            return Err(SnapshotConsistencyError::CountMismatch {
                parent_type_url,
                dependency_type_url,
                references: references.join(", "),
                count: dependencies.len(),
            });
        }

        for name in references {
            if !dependencies.contains_key(name) {
                let mut listed: Vec<&str> = dependencies.keys().map(String::as_str).collect();
                listed.sort();
                return Err(SnapshotConsistencyError::MissingName {
                    parent_type_url,
                    dependency_type_url,
                    name: name.clone(),
                    listed: listed.join(", "),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_plane_api::envoy::config::cluster::v3::cluster;

    fn eds_cluster(name: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::Eds as i32,
            )),
            ..Cluster::default()
        }
    }

    fn endpoint(cluster_name: &str) -> ClusterLoadAssignment {
        ClusterLoadAssignment {
            cluster_name: cluster_name.to_string(),
            ..ClusterLoadAssignment::default()
        }
    }

    #[test]
    fn version_is_empty_for_unknown_or_empty_type() {
        let snapshot = Snapshot::with_version(vec![], vec![], vec![], vec![], vec![], "v1");
        assert_eq!(snapshot.version("", &[]), "");
        assert_eq!(snapshot.version("type.googleapis.com/unknown.Type", &[]), "");
        assert_eq!(snapshot.version(type_url::CLUSTER, &[]), "v1");
    }

    #[test]
    fn resources_are_keyed_by_name() {
        let snapshot = Snapshot::with_version(
            vec![eds_cluster("cluster0")],
            vec![endpoint("cluster0")],
            vec![],
            vec![],
            vec![],
            "v1",
        );
        let clusters = snapshot.resources(type_url::CLUSTER).unwrap();
        assert!(clusters.items().contains_key("cluster0"));
        assert!(snapshot.resources("").is_none());
    }

    #[test]
    fn per_set_versions_resolve_independently() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            type_url::CLUSTER,
            SnapshotResources::new(vec![Resource::Cluster(eds_cluster("cluster0"))], "v3"),
        );
        snapshot.insert(type_url::ENDPOINT, SnapshotResources::new(vec![], "v7"));
        assert_eq!(snapshot.version(type_url::CLUSTER, &[]), "v3");
        assert_eq!(snapshot.version(type_url::ENDPOINT, &[]), "v7");
    }

    #[test]
    fn custom_resolver_sees_the_requested_names() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            type_url::ENDPOINT,
            SnapshotResources::with_resolver(
                vec![Resource::Endpoint(endpoint("cluster0"))],
                Arc::new(|names: &[String]| {
                    // Per-resource policy: aggregate version unless exactly
                    // one known name is requested.
                    if names == ["cluster0"] {
                        "v1-cluster0".to_string()
                    } else {
                        "aggregate".to_string()
                    }
                }),
            ),
        );
        assert_eq!(
            snapshot.version(type_url::ENDPOINT, &["cluster0".to_string()]),
            "v1-cluster0"
        );
        assert_eq!(snapshot.version(type_url::ENDPOINT, &[]), "aggregate");
        assert_eq!(
            snapshot.version(
                type_url::ENDPOINT,
                &["cluster0".to_string(), "other".to_string()]
            ),
            "aggregate"
        );
    }

    #[test]
    fn consistent_snapshot_passes_the_check() {
        let snapshot = Snapshot::with_version(
            vec![eds_cluster("cluster0")],
            vec![endpoint("cluster0")],
            vec![],
            vec![],
            vec![],
            "v1",
        );
        assert!(snapshot.ensure_consistent().is_ok());
    }

    #[test]
    fn missing_endpoint_fails_with_count_mismatch() {
        let snapshot = Snapshot::with_version(
            vec![eds_cluster("cluster0")],
            vec![],
            vec![],
            vec![],
            vec![],
            "v1",
        );
        match snapshot.ensure_consistent() {
            Err(SnapshotConsistencyError::CountMismatch {
                parent_type_url,
                dependency_type_url,
                ..
            }) => {
                assert_eq!(parent_type_url, type_url::CLUSTER);
                assert_eq!(dependency_type_url, type_url::ENDPOINT);
            }
            other => panic!("expected count mismatch, got {:?}", other),
        }
    }

    #[test]
    fn misnamed_endpoint_fails_naming_the_missing_reference() {
        let snapshot = Snapshot::with_version(
            vec![eds_cluster("cluster0")],
            vec![endpoint("other")],
            vec![],
            vec![],
            vec![],
            "v1",
        );
        match snapshot.ensure_consistent() {
            Err(SnapshotConsistencyError::MissingName { name, listed, .. }) => {
                assert_eq!(name, "cluster0");
                assert_eq!(listed, "other");
            }
            other => panic!("expected missing name, got {:?}", other),
        }
    }
}
