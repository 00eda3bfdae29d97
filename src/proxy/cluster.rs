use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config;

/// Endpoint liveness as seen by the dispatch path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HealthStatus::Healthy,
            2 => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{}", status)
    }
}

/// Per-endpoint health flag plus consecutive-result counters.
///
/// Exactly one writer (the endpoint's probe loop) mutates this; the dispatch
/// path and diagnostics only read. The flag is a single atomic byte so a
/// reader can never observe a torn intermediate state.
pub struct EndpointHealth {
    status: AtomicU8,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl EndpointHealth {
    fn new(initial: HealthStatus) -> Self {
        Self {
            status: AtomicU8::new(initial as u8),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Feeds one successful probe into the state machine. Returns the new
    /// status only when a transition happened.
    pub fn record_success(&self, healthy_threshold: u32) -> Option<HealthStatus> {
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        self.consecutive_failures.store(0, Ordering::Relaxed);

        if successes >= healthy_threshold && self.status() != HealthStatus::Healthy {
            self.status
                .store(HealthStatus::Healthy as u8, Ordering::Release);
            return Some(HealthStatus::Healthy);
        }
        None
    }

    /// Feeds one failed or timed-out probe into the state machine.
    pub fn record_failure(&self, unhealthy_threshold: u32) -> Option<HealthStatus> {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.consecutive_successes.store(0, Ordering::Relaxed);

        if failures >= unhealthy_threshold && self.status() != HealthStatus::Unhealthy {
            self.status
                .store(HealthStatus::Unhealthy as u8, Ordering::Release);
            return Some(HealthStatus::Unhealthy);
        }
        None
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// One network-addressable backend instance within a cluster.
pub struct Endpoint {
    pub addr: String,
    pub weight: u32,
    pub health: EndpointHealth,
}

impl Endpoint {
    pub fn is_available(&self) -> bool {
        self.health.status() == HealthStatus::Healthy
    }
}

/// Immutable runtime descriptor of one cluster.
///
/// A configuration change produces a replacement `ClusterInfo`; the old one
/// stays valid for requests and probers still holding it. Endpoints that
/// survive a rebuild keep their `Arc<Endpoint>` so probe-driven health is
/// never lost across a reload.
pub struct ClusterInfo {
    pub inner: config::Cluster,
    config_hash: u64,
    endpoints: Vec<Arc<Endpoint>>,
}

impl ClusterInfo {
    pub fn new(cluster: config::Cluster) -> Self {
        Self::rebuild(cluster, None)
    }

    pub fn rebuild(cluster: config::Cluster, previous: Option<&ClusterInfo>) -> Self {
        // Endpoints of a cluster that is never probed must stay routable.
        let initial = if cluster.checks.is_some() {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        };

        let config_hash = cluster.config_hash();
        let endpoints = cluster
            .nodes
            .iter()
            .map(|(addr, weight)| {
                // Probe-driven health is only meaningful while the cluster
                // keeps its checks; once they are removed nothing will ever
                // probe the endpoint back to Healthy.
                if cluster.checks.is_some() {
                    if let Some(existing) = previous.and_then(|prev| prev.endpoint(addr)) {
                        // Same address: keep the live health object
                        return existing;
                    }
                }
                Arc::new(Endpoint {
                    addr: addr.clone(),
                    weight: *weight,
                    health: EndpointHealth::new(initial),
                })
            })
            .collect();

        Self {
            inner: cluster,
            config_hash,
            endpoints,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config_hash(&self) -> u64 {
        self.config_hash
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn endpoint(&self, addr: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .find(|e| e.addr == addr)
            .cloned()
    }

    /// Endpoints currently eligible for forwarding.
    pub fn healthy_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|e| e.is_available())
            .cloned()
            .collect()
    }

    pub fn active_check(&self) -> Option<&config::ActiveCheck> {
        self.inner.checks.as_ref().map(|c| &c.active)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.active_check().map(|c| c.interval).unwrap_or(5))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.active_check().map(|c| c.timeout).unwrap_or(1))
    }
}
