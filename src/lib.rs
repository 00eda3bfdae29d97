//! Runtime core of a reverse-proxy gateway: an immutable, hot-swappable
//! routing configuration model plus a per-cluster active health-probing
//! engine that feeds endpoint eligibility back to the dispatch path.

pub mod config;
pub mod core;
pub mod logging;
pub mod proxy;
