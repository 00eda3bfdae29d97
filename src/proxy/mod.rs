pub mod cluster;
pub mod health_check;
pub mod route;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use cluster::{ClusterInfo, Endpoint, HealthStatus};
pub use health_check::{ClusterProber, ProberManager, ProbeTransport};
pub use route::RouteConfig;
pub use snapshot::{ConfigManager, ConfigSnapshot};
