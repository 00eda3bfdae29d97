//! End-to-end coverage of reload, routing and probing working together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::cluster::HealthStatus;
use super::health_check::{ProbeFailure, ProbeTransport, ProberManager, TransportFactory};
use super::snapshot::ConfigManager;
use crate::config;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Switchable fake: every probe succeeds or fails depending on a shared
/// toggle, so tests can simulate a backend going down.
struct ToggleTransport {
    healthy: std::sync::atomic::AtomicBool,
    calls: AtomicUsize,
}

impl ToggleTransport {
    fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: std::sync::atomic::AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
        })
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProbeTransport for ToggleTransport {
    async fn check(&self, _addr: &str, _timeout: Duration) -> Result<Duration, ProbeFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(Duration::ZERO)
        } else {
            Err(ProbeFailure::Connect("connection refused".to_string()))
        }
    }
}

fn factory(transport: Arc<ToggleTransport>) -> TransportFactory {
    Arc::new(move |_check| Ok(transport.clone() as Arc<dyn ProbeTransport>))
}

async fn wait_until<F: Fn() -> bool>(cond: F, max: Duration) -> bool {
    let deadline = Instant::now() + max;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

const GATEWAY_CONF: &str = r#"
routes:
  - id: api
    uri: /api/{*rest}
    host: api.example.com
    cluster_id: web

clusters:
  - id: web
    nodes:
      "127.0.0.1:1980": 1
    checks:
      active:
        type: tcp
        interval: 1
        healthy_threshold: 1
        unhealthy_threshold: 2
"#;

#[tokio::test]
async fn test_probe_results_reach_the_dispatch_path() {
    init_log();
    let config_manager = ConfigManager::new();
    let transport = ToggleTransport::new(true);
    let conf = config::Config::from_yaml(GATEWAY_CONF).unwrap();
    let probers = ProberManager::with_transport_factory(
        conf.max_concurrent_probes,
        factory(transport.clone()),
    );

    let snapshot = config_manager.apply(conf).unwrap();
    probers.apply_snapshot(&snapshot).await;

    // probed endpoints start out ineligible until a success comes in
    let (_, route) = snapshot
        .match_request(Some("api.example.com"), "/api/users", "GET")
        .unwrap();
    assert!(wait_until(
        || !route.cluster.healthy_endpoints().is_empty(),
        Duration::from_secs(3)
    )
    .await);

    // backend goes down: two consecutive failures flip it to unhealthy and
    // the same snapshot reference sees the change
    transport.set_healthy(false);
    assert!(wait_until(
        || route.cluster.healthy_endpoints().is_empty(),
        Duration::from_secs(6)
    )
    .await);
    assert_eq!(
        HealthStatus::Unhealthy,
        route.cluster.endpoints()[0].health.status()
    );

    probers.shutdown().await;
}

#[tokio::test]
async fn test_reload_preserves_health_and_retires_probers() {
    init_log();
    let config_manager = ConfigManager::new();
    let transport = ToggleTransport::new(true);
    let probers = ProberManager::with_transport_factory(8, factory(transport.clone()));

    let first = config_manager
        .apply(config::Config::from_yaml(GATEWAY_CONF).unwrap())
        .unwrap();
    probers.apply_snapshot(&first).await;

    let endpoint = first.cluster("web").unwrap().endpoint("127.0.0.1:1980").unwrap();
    assert!(wait_until(|| endpoint.is_available(), Duration::from_secs(3)).await);

    // a route-only change keeps the cluster, its endpoints and its prober
    let changed = GATEWAY_CONF.replace("uri: /api/{*rest}", "uri: /v2/{*rest}");
    let second = config_manager
        .apply(config::Config::from_yaml(&changed).unwrap())
        .unwrap();
    let prober_before = probers.prober("web").unwrap();
    probers.apply_snapshot(&second).await;

    assert!(Arc::ptr_eq(&prober_before, &probers.prober("web").unwrap()));
    let kept = second.cluster("web").unwrap().endpoint("127.0.0.1:1980").unwrap();
    assert!(Arc::ptr_eq(&endpoint, &kept));
    assert!(kept.is_available());

    // dropping the cluster retires its prober and no probe runs afterwards
    let third = config_manager
        .apply(config::Config::from_yaml("clusters: []").unwrap())
        .unwrap();
    probers.apply_snapshot(&third).await;
    assert_eq!(0, probers.prober_count());

    let calls = transport.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(calls, transport.calls.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_old_snapshot_stays_usable_after_reload() {
    init_log();
    let config_manager = ConfigManager::new();

    let first = config_manager
        .apply(config::Config::from_yaml(GATEWAY_CONF).unwrap())
        .unwrap();

    let changed = GATEWAY_CONF.replace("host: api.example.com", "host: api.example.org");
    let _second = config_manager
        .apply(config::Config::from_yaml(&changed).unwrap())
        .unwrap();

    // a request that raced the reload still resolves against its snapshot
    assert!(first
        .match_request(Some("api.example.com"), "/api/users", "GET")
        .is_some());
    assert!(config_manager
        .snapshot()
        .match_request(Some("api.example.com"), "/api/users", "GET")
        .is_none());
}
