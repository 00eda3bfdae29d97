use std::collections::BTreeMap;
use std::sync::Arc;

use matchit::{InsertError, Router as MatchRouter};

use super::cluster::ClusterInfo;
use crate::config;

/// Immutable snapshot of the portions of a route that only change in
/// reaction to configuration changes (rule, priority, transforms, target
/// cluster).
///
/// Instances are replaced in their entirety when values need to change; the
/// precomputed hash makes the replace-or-reuse decision cheap.
pub struct RouteConfig {
    pub inner: config::Route,
    config_hash: u64,
    pub cluster: Arc<ClusterInfo>,
}

impl RouteConfig {
    pub fn new(route: config::Route, cluster: Arc<ClusterInfo>) -> Self {
        let config_hash = route.config_hash();
        Self {
            inner: route,
            config_hash,
            cluster,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config_hash(&self) -> u64 {
        self.config_hash
    }

    /// Single authority for deciding whether a route needs rebuilding on
    /// reload: the referenced cluster identity differs, or the rule content
    /// hash differs.
    pub fn has_config_changed(
        &self,
        new_rule: &config::Route,
        new_cluster: &Arc<ClusterInfo>,
    ) -> bool {
        !Arc::ptr_eq(&self.cluster, new_cluster) || self.config_hash != new_rule.config_hash()
    }
}

/// Compiled request matcher of one snapshot.
#[derive(Default)]
pub struct MatchEntry {
    /// Router for non-host URI matching
    non_host_uri: MatchRouter<Vec<Arc<RouteConfig>>>,
    /// Router for host URI matching
    host_uris: MatchRouter<MatchRouter<Vec<Arc<RouteConfig>>>>,
}

impl MatchEntry {
    /// Converts wildcard patterns to matchit format for reversed hosts.
    fn reversed_host(host: &str) -> String {
        if let Some(domain_part) = host.strip_prefix('*') {
            // Convert "*.example.com" to "moc.elpmaxe.{*subdomain}"
            // so matchit can match any subdomain suffix when reversed
            let reversed_domain: String = domain_part.chars().rev().collect();
            format!("{reversed_domain}{{*subdomain}}")
        } else {
            host.chars().rev().collect()
        }
    }

    fn insert_into_router(
        router: &mut MatchRouter<Vec<Arc<RouteConfig>>>,
        uri: &str,
        route: Arc<RouteConfig>,
    ) -> Result<(), InsertError> {
        match router.at_mut(uri) {
            Ok(routes) => {
                routes.value.push(route);
                // Sort routes by priority (higher priority values take precedence)
                routes
                    .value
                    .sort_by(|a, b| b.inner.priority.cmp(&a.inner.priority));
            }
            Err(_) => {
                router.insert(uri, vec![route])?;
            }
        }
        Ok(())
    }

    /// Inserts a route into the match entry.
    pub fn insert_route(&mut self, route: Arc<RouteConfig>) -> Result<(), InsertError> {
        let hosts = route.inner.get_hosts();
        let uris = route.inner.get_uris();

        if hosts.is_empty() {
            for uri in &uris {
                Self::insert_into_router(&mut self.non_host_uri, uri, route.clone())?;
            }
        } else {
            for host in hosts.iter() {
                let processed_host = Self::reversed_host(host);
                let inner_router = match self.host_uris.at_mut(processed_host.as_str()) {
                    Ok(router) => router.value,
                    Err(_) => {
                        self.host_uris
                            .insert(processed_host.clone(), MatchRouter::new())?;
                        self.host_uris
                            .at_mut(processed_host.as_str())
                            .unwrap()
                            .value
                    }
                };

                for uri in &uris {
                    Self::insert_into_router(inner_router, uri, route.clone())?;
                }
            }
        }

        Ok(())
    }

    /// Matches a request to a route.
    pub fn match_request(
        &self,
        host: Option<&str>,
        path: &str,
        method: &str,
    ) -> Option<(BTreeMap<String, String>, Arc<RouteConfig>)> {
        log::debug!("match request: host={host:?}, path={path:?}, method={method:?}");

        // Attempt to match using host_uris if a valid host is provided
        if let Some(host_str) = host.filter(|h| !h.is_empty()) {
            let reversed_host = host_str.chars().rev().collect::<String>();
            if let Ok(v) = self.host_uris.at(&reversed_host) {
                if let Some(result) = Self::match_uri_method(v.value, path, method) {
                    return Some(result);
                }
            }
        }

        // Fall back to non-host URI matching
        Self::match_uri_method(&self.non_host_uri, path, method)
    }

    /// Matches a URI and method against one inner router.
    fn match_uri_method(
        match_router: &MatchRouter<Vec<Arc<RouteConfig>>>,
        path: &str,
        method: &str,
    ) -> Option<(BTreeMap<String, String>, Arc<RouteConfig>)> {
        if let Ok(v) = match_router.at(path) {
            let params: BTreeMap<String, String> = v
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();

            for route in v.value.iter() {
                if route.inner.methods.is_empty() {
                    return Some((params, route.clone()));
                }

                // Match method
                if route.inner.methods.iter().any(|m| m.to_string() == method) {
                    return Some((params, route.clone()));
                }
            }
        }
        None
    }
}
