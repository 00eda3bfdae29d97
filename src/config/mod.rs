use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::{ProxyError, ProxyResult};

/// Full source configuration consumed on every reload cycle.
///
/// The gateway never applies incremental deltas; a reload always carries the
/// complete route and cluster set.
#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_references"))]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub routes: Vec<Route>,
    #[validate(nested)]
    #[serde(default)]
    pub clusters: Vec<Cluster>,

    /// Cap on probe operations in flight across every cluster of this
    /// gateway instance.
    #[serde(default = "Config::default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    pub log: Option<Log>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            clusters: Vec::new(),
            max_concurrent_probes: Self::default_max_concurrent_probes(),
            log: None,
        }
    }
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> ProxyResult<Self>
    where
        P: AsRef<std::path::Path> + fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).map_err(|e| {
            ProxyError::Configuration(format!("Unable to read conf file from {path}: {e}"))
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> ProxyResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)?;

        trace!("Loaded conf: {conf:?}");

        // use validator to validate conf file
        conf.validate()?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }

    fn default_max_concurrent_probes() -> usize {
        64
    }

    fn validate_references(&self) -> Result<(), ValidationError> {
        let mut route_ids = HashSet::new();
        for route in &self.routes {
            if !route_ids.insert(route.id.as_str()) {
                let mut err = ValidationError::new("duplicate_route_id");
                err.add_param("id".into(), &route.id);
                return Err(err);
            }
        }

        let mut cluster_ids = HashSet::new();
        for cluster in &self.clusters {
            if !cluster_ids.insert(cluster.id.as_str()) {
                let mut err = ValidationError::new("duplicate_cluster_id");
                err.add_param("id".into(), &cluster.id);
                return Err(err);
            }
        }

        for route in &self.routes {
            if !cluster_ids.contains(route.cluster_id.as_str()) {
                let mut err = ValidationError::new("unknown_cluster_id");
                err.add_param("route".into(), &route.id);
                err.add_param("cluster_id".into(), &route.cluster_id);
                return Err(err);
            }
        }

        // A probe that wants more permits than the limiter holds would
        // block its cluster's loops forever.
        for cluster in &self.clusters {
            if let Some(checks) = &cluster.checks {
                if checks.active.concurrency_weight as usize > self.max_concurrent_probes {
                    let mut err = ValidationError::new("concurrency_weight_exceeds_probe_limit");
                    err.add_param("cluster".into(), &cluster.id);
                    err.add_param(
                        "concurrency_weight".into(),
                        &checks.active.concurrency_weight,
                    );
                    err.add_param(
                        "max_concurrent_probes".into(),
                        &self.max_concurrent_probes,
                    );
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Hash, Serialize, Deserialize, Validate)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Hash, Serialize, Deserialize, Validate)]
pub struct Timeout {
    pub connect: u64,
    pub send: u64,
    pub read: u64,
}

/// One route's matching rule plus the cluster it forwards to.
///
/// Every field participates in the derived `Hash`; `config_hash` is the
/// cheap change-detection authority used when diffing reloads.
#[derive(Clone, Debug, Hash, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Route::validate_rule"))]
pub struct Route {
    pub id: String,

    pub uri: Option<String>,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub methods: Vec<HttpMethod>,
    pub host: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "Route::default_priority")]
    pub priority: u32,

    pub cluster_id: String,

    /// Ordered request/response transforms. A `BTreeMap` keeps the derived
    /// hash independent of declaration order within one transform.
    #[serde(default)]
    pub transforms: Vec<BTreeMap<String, String>>,
}

impl Route {
    fn validate_rule(&self) -> Result<(), ValidationError> {
        if self.uri.is_none() && self.uris.is_empty() {
            return Err(ValidationError::new("uri_or_uris_required"));
        }

        if self.cluster_id.is_empty() {
            return Err(ValidationError::new("cluster_id_required"));
        }

        Ok(())
    }

    pub fn get_hosts(&self) -> Vec<String> {
        if let Some(host) = &self.host {
            vec![host.to_string()]
        } else {
            self.hosts.clone()
        }
    }

    pub fn get_uris(&self) -> Vec<String> {
        if let Some(uri) = &self.uri {
            vec![uri.to_string()]
        } else {
            self.uris.clone()
        }
    }

    pub fn config_hash(&self) -> u64 {
        hash_of(self)
    }

    fn default_priority() -> u32 {
        0
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
    CONNECT,
    TRACE,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let method = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::CONNECT => "CONNECT",
            HttpMethod::TRACE => "TRACE",
        };
        write!(f, "{}", method)
    }
}

/// A named group of interchangeable endpoints a route can forward to.
#[derive(Clone, Debug, Hash, Serialize, Deserialize, Validate)]
pub struct Cluster {
    pub id: String,

    /// Endpoint address -> load-balancing weight.
    #[validate(length(min = 1), custom(function = "Cluster::validate_nodes_keys"))]
    pub nodes: BTreeMap<String, u32>,

    #[validate(nested)]
    pub timeout: Option<Timeout>,
    #[validate(nested)]
    pub checks: Option<HealthCheck>,
}

static NODE_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:]+\]|[a-z0-9.-]+)(?::\d+)?$").unwrap()
});

impl Cluster {
    pub fn config_hash(&self) -> u64 {
        hash_of(self)
    }

    // Custom validation function for `nodes` keys
    fn validate_nodes_keys(nodes: &BTreeMap<String, u32>) -> Result<(), ValidationError> {
        for key in nodes.keys() {
            if !NODE_KEY_REGEX.is_match(key) {
                let mut err = ValidationError::new("invalid_node_key");
                err.add_param("key".into(), &key.to_string());
                return Err(err);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, Serialize, Deserialize, Validate)]
pub struct HealthCheck {
    // only active probing is supported
    #[validate(nested)]
    pub active: ActiveCheck,
}

#[derive(Clone, Debug, Hash, Serialize, Deserialize, Validate)]
#[validate(schema(function = "ActiveCheck::validate_check"))]
pub struct ActiveCheck {
    #[serde(default)]
    pub r#type: ActiveCheckType,
    /// Seconds between probe cycles per endpoint.
    #[serde(default = "ActiveCheck::default_interval")]
    pub interval: u64,
    /// Seconds before an in-flight probe counts as failed.
    #[serde(default = "ActiveCheck::default_timeout")]
    pub timeout: u64,
    #[serde(default = "ActiveCheck::default_http_path")]
    pub http_path: String,
    pub host: Option<String>,
    #[serde(default = "ActiveCheck::default_http_statuses")]
    pub http_statuses: Vec<u16>,
    /// Consecutive successes before an endpoint turns Healthy.
    #[serde(default = "ActiveCheck::default_healthy_threshold")]
    pub healthy_threshold: u32,
    /// Consecutive failures before an endpoint turns Unhealthy.
    #[serde(default = "ActiveCheck::default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Shared-limiter permits one in-flight probe of this cluster consumes.
    #[serde(default = "ActiveCheck::default_concurrency_weight")]
    pub concurrency_weight: u32,
}

#[derive(Clone, Copy, Default, Debug, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveCheckType {
    #[default]
    TCP,
    HTTP,
}

impl ActiveCheck {
    fn validate_check(&self) -> Result<(), ValidationError> {
        if self.interval == 0 || self.timeout == 0 {
            return Err(ValidationError::new("interval_and_timeout_required"));
        }

        if self.healthy_threshold == 0 || self.unhealthy_threshold == 0 {
            return Err(ValidationError::new("thresholds_must_be_positive"));
        }

        if self.concurrency_weight == 0 {
            return Err(ValidationError::new("concurrency_weight_must_be_positive"));
        }

        Ok(())
    }

    fn default_interval() -> u64 {
        5
    }

    fn default_timeout() -> u64 {
        1
    }

    fn default_http_path() -> String {
        "/".to_string()
    }

    fn default_http_statuses() -> Vec<u16> {
        vec![200, 302]
    }

    fn default_healthy_threshold() -> u32 {
        1
    }

    fn default_unhealthy_threshold() -> u32 {
        3
    }

    fn default_concurrency_weight() -> u32 {
        1
    }
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
routes:
  - id: 1
    uri: /
    cluster_id: web

clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
    checks:
      active:
        type: tcp
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str).unwrap();
        assert_eq!(1, conf.routes.len());
        assert_eq!(1, conf.clusters.len());
        assert_eq!(64, conf.max_concurrent_probes);

        let check = conf.clusters[0].checks.as_ref().unwrap();
        assert_eq!(5, check.active.interval);
        assert_eq!(1, check.active.timeout);
        assert_eq!(1, check.active.healthy_threshold);
        assert_eq!(3, check.active.unhealthy_threshold);
        assert_eq!(1, check.active.concurrency_weight);
        print!("{}", conf.to_yaml());
    }

    #[test]
    fn test_valid_route_uri_required() {
        init_log();
        let conf_str = r#"
---
routes:
  - id: 1
    cluster_id: web

clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str);
        match conf {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_valid_dangling_cluster_id() {
        init_log();
        let conf_str = r#"
---
routes:
  - id: 1
    uri: /
    cluster_id: missing

clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str);
        match conf {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_valid_duplicate_cluster_id() {
        init_log();
        let conf_str = r#"
---
clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
  - id: web
    nodes:
      "127.0.0.1:1981": 1
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str);
        match conf {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_valid_node_keys() {
        init_log();
        let conf_str = r#"
---
clusters:
  - id: web
    nodes:
      "not a host:80": 1
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str);
        match conf {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_valid_nested_active_check() {
        init_log();
        let conf_str = r#"
---
clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
    checks:
      active:
        type: tcp
        interval: 0
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str);
        match conf {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_valid_concurrency_weight_within_probe_limit() {
        init_log();
        let conf_str = r#"
---
max_concurrent_probes: 2
clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
    checks:
      active:
        type: tcp
        concurrency_weight: 8
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str);
        match conf {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_config_hash_is_stable() {
        init_log();
        let conf_str = r#"
---
routes:
  - id: 1
    uri: /
    cluster_id: web

clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
        "#;
        let a = Config::from_yaml(conf_str).unwrap();
        let b = Config::from_yaml(conf_str).unwrap();
        assert_eq!(a.routes[0].config_hash(), b.routes[0].config_hash());
        assert_eq!(a.clusters[0].config_hash(), b.clusters[0].config_hash());
    }

    #[test]
    fn test_config_hash_tracks_node_change() {
        init_log();
        let base = r#"
---
clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
        "#;
        let changed = r#"
---
clusters:
  - id: web
    nodes:
      "127.0.0.1:1981": 1
        "#;
        let a = Config::from_yaml(base).unwrap();
        let b = Config::from_yaml(changed).unwrap();
        assert_ne!(a.clusters[0].config_hash(), b.clusters[0].config_hash());
    }
}
