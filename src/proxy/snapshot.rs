use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use log::info;
use validator::Validate;

use super::cluster::ClusterInfo;
use super::route::{MatchEntry, RouteConfig};
use crate::config;
use crate::core::{ProxyError, ProxyResult};

/// Immutable aggregate of all live routes and clusters at a point in time.
///
/// The dispatch path reads the current snapshot through a single atomically
/// replaceable reference; a snapshot never changes after publication and
/// stays valid for requests and probers still holding it.
pub struct ConfigSnapshot {
    version: u64,
    routes: HashMap<String, Arc<RouteConfig>>,
    clusters: HashMap<String, Arc<ClusterInfo>>,
    matcher: MatchEntry,
}

impl ConfigSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            routes: HashMap::new(),
            clusters: HashMap::new(),
            matcher: MatchEntry::default(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn route(&self, id: &str) -> Option<Arc<RouteConfig>> {
        self.routes.get(id).cloned()
    }

    pub fn cluster(&self, id: &str) -> Option<Arc<ClusterInfo>> {
        self.clusters.get(id).cloned()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<RouteConfig>> {
        self.routes.values()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Arc<ClusterInfo>> {
        self.clusters.values()
    }

    /// Route lookup for an incoming request.
    pub fn match_request(
        &self,
        host: Option<&str>,
        path: &str,
        method: &str,
    ) -> Option<(BTreeMap<String, String>, Arc<RouteConfig>)> {
        self.matcher.match_request(host, path, method)
    }
}

/// Builds and publishes configuration snapshots.
///
/// Reloads are serialized; readers load the current snapshot without taking
/// any lock. Unchanged routes and clusters are carried into the next
/// snapshot by reference, so downstream consumers can detect "nothing
/// changed" with a pointer comparison instead of a deep one.
pub struct ConfigManager {
    current: ArcSwap<ConfigSnapshot>,
    // Serializes reloads and owns the snapshot version counter.
    reload_lock: Mutex<u64>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ConfigSnapshot::empty()),
            reload_lock: Mutex::new(0),
        }
    }

    /// Lock-free read of the currently published snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Builds a snapshot from a full source configuration and publishes it
    /// atomically.
    ///
    /// A rejected configuration leaves the previous snapshot active and
    /// authoritative; nothing partial is ever published.
    pub fn apply(&self, conf: config::Config) -> ProxyResult<Arc<ConfigSnapshot>> {
        conf.validate()?;

        let mut version = self
            .reload_lock
            .lock()
            .map_err(|_| ProxyError::Internal("config reload lock poisoned".to_string()))?;
        let previous = self.current.load();

        // Reuse-or-rebuild clusters, keyed by cluster id and content hash.
        let mut clusters = HashMap::with_capacity(conf.clusters.len());
        for cluster_conf in conf.clusters {
            let id = cluster_conf.id.clone();
            let cluster = match previous.cluster(&id) {
                Some(existing) if existing.config_hash() == cluster_conf.config_hash() => existing,
                old => {
                    info!("Configuring Cluster: {id}");
                    Arc::new(ClusterInfo::rebuild(cluster_conf, old.as_deref()))
                }
            };
            clusters.insert(id, cluster);
        }

        // Reuse-or-rebuild routes; `has_config_changed` is the authority.
        let mut routes = HashMap::with_capacity(conf.routes.len());
        let mut matcher = MatchEntry::default();
        for route_conf in conf.routes {
            let cluster = clusters
                .get(&route_conf.cluster_id)
                .cloned()
                .ok_or_else(|| ProxyError::UnknownCluster {
                    route_id: route_conf.id.clone(),
                    cluster_id: route_conf.cluster_id.clone(),
                })?;

            let id = route_conf.id.clone();
            let route = match previous.route(&id) {
                Some(existing) if !existing.has_config_changed(&route_conf, &cluster) => existing,
                _ => {
                    info!("Configuring Route: {id}");
                    Arc::new(RouteConfig::new(route_conf, cluster))
                }
            };

            matcher
                .insert_route(route.clone())
                .map_err(|e| ProxyError::InvalidRouteRule {
                    route_id: id.clone(),
                    reason: e.to_string(),
                })?;
            routes.insert(id, route);
        }

        *version += 1;
        let snapshot = Arc::new(ConfigSnapshot {
            version: *version,
            routes,
            clusters,
            matcher,
        });
        self.current.store(snapshot.clone());

        info!(
            "Published configuration snapshot v{} ({} routes, {} clusters)",
            snapshot.version,
            snapshot.routes.len(),
            snapshot.clusters.len()
        );
        Ok(snapshot)
    }
}
