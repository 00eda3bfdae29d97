use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use super::cluster::{ClusterInfo, Endpoint};
use super::snapshot::ConfigSnapshot;
use crate::config::{ActiveCheck, ActiveCheckType};
use crate::core::{ProxyError, ProxyResult};

/// Why a single probe did not succeed. Feeds the endpoint state machine and
/// nothing else; a probe failure is never an error to the prober's caller.
#[derive(Debug)]
pub enum ProbeFailure {
    Timeout,
    Connect(String),
    BadStatus(u16),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timed out"),
            ProbeFailure::Connect(e) => write!(f, "connect failed: {e}"),
            ProbeFailure::BadStatus(status) => write!(f, "unexpected status {status}"),
        }
    }
}

/// Transient outcome of one probe; updates `EndpointHealth`, then dropped.
#[derive(Debug)]
pub struct ProbeResult {
    pub addr: String,
    pub success: bool,
    pub latency: Duration,
    pub failure: Option<ProbeFailure>,
}

/// Abstract liveness-check capability.
///
/// The prober only needs this contract; whether the check is a TCP connect,
/// an HTTP request or a custom protocol is up to the implementation.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn check(&self, addr: &str, timeout: Duration) -> Result<Duration, ProbeFailure>;
}

/// Liveness check by TCP connect.
pub struct TcpProbe;

#[async_trait]
impl ProbeTransport for TcpProbe {
    async fn check(&self, addr: &str, timeout: Duration) -> Result<Duration, ProbeFailure> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(ProbeFailure::Connect(e.to_string())),
            Err(_) => Err(ProbeFailure::Timeout),
        }
    }
}

/// Liveness check by a minimal HTTP/1.1 GET; only the status line of the
/// response is consumed.
pub struct HttpProbe {
    path: String,
    host: Option<String>,
    expected_statuses: Vec<u16>,
}

impl HttpProbe {
    pub fn new(check: &ActiveCheck) -> Self {
        Self {
            path: check.http_path.clone(),
            host: check.host.clone(),
            expected_statuses: check.http_statuses.clone(),
        }
    }

    async fn request_status(&self, addr: &str) -> Result<u16, ProbeFailure> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProbeFailure::Connect(e.to_string()))?;

        let host = self.host.as_deref().unwrap_or(addr);
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: fluxgate-health-check\r\nConnection: close\r\n\r\n",
            self.path, host
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ProbeFailure::Connect(e.to_string()))?;

        // The status line may arrive in segments; read until its end.
        let mut buf = Vec::with_capacity(128);
        let mut chunk = [0u8; 256];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| ProbeFailure::Connect(e.to_string()))?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.contains(&b'\n') || buf.len() >= 512 {
                break;
            }
        }

        let line_end = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
        parse_status_line(&buf[..line_end])
            .ok_or_else(|| ProbeFailure::Connect("malformed response".to_string()))
    }
}

#[async_trait]
impl ProbeTransport for HttpProbe {
    async fn check(&self, addr: &str, timeout: Duration) -> Result<Duration, ProbeFailure> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, self.request_status(addr)).await {
            Ok(Ok(status)) => {
                if self.expected_statuses.contains(&status) {
                    Ok(start.elapsed())
                } else {
                    Err(ProbeFailure::BadStatus(status))
                }
            }
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(ProbeFailure::Timeout),
        }
    }
}

// "HTTP/1.1 200 OK" -> 200
fn parse_status_line(bytes: &[u8]) -> Option<u16> {
    let line = std::str::from_utf8(bytes).ok()?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Picks a transport for a cluster's configured check type.
pub type TransportFactory =
    Arc<dyn Fn(&ActiveCheck) -> ProxyResult<Arc<dyn ProbeTransport>> + Send + Sync>;

fn default_transport(check: &ActiveCheck) -> ProxyResult<Arc<dyn ProbeTransport>> {
    match check.r#type {
        ActiveCheckType::TCP => Ok(Arc::new(TcpProbe)),
        ActiveCheckType::HTTP => Ok(Arc::new(HttpProbe::new(check))),
    }
}

#[derive(Clone)]
struct ProbeParams {
    interval: Duration,
    timeout: Duration,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    concurrency_weight: u32,
}

impl From<&ActiveCheck> for ProbeParams {
    fn from(check: &ActiveCheck) -> Self {
        Self {
            interval: Duration::from_secs(check.interval),
            timeout: Duration::from_secs(check.timeout),
            healthy_threshold: check.healthy_threshold,
            unhealthy_threshold: check.unhealthy_threshold,
            concurrency_weight: check.concurrency_weight,
        }
    }
}

/// Continuously verifies the liveness of every endpoint of one cluster.
///
/// One prober owns one scheduling loop per endpoint (the endpoint set is
/// fixed at start time; a cluster change replaces the whole prober). All
/// loops share the gateway-wide concurrency limiter passed into `start`.
pub struct ClusterProber {
    cluster: Arc<ClusterInfo>,
    transport: Arc<dyn ProbeTransport>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ClusterProber {
    pub fn new(cluster: Arc<ClusterInfo>, transport: Arc<dyn ProbeTransport>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cluster,
            transport,
            shutdown,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// The cluster this prober is checking.
    pub fn cluster_id(&self) -> &str {
        self.cluster.id()
    }

    /// The exact `ClusterInfo` this prober was constructed against, used to
    /// detect "this cluster's config changed, replace the prober".
    pub fn cluster(&self) -> &Arc<ClusterInfo> {
        &self.cluster
    }

    /// Starts one probe loop per endpoint. Starting twice is a
    /// reconciliation bug and fails fast.
    pub fn start(&self, limiter: Arc<Semaphore>) -> ProxyResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::ProberAlreadyStarted(
                self.cluster.id().to_string(),
            ));
        }

        let check = self.cluster.active_check().ok_or_else(|| {
            ProxyError::Configuration(format!(
                "cluster '{}' has no active check configured",
                self.cluster.id()
            ))
        })?;
        let params = ProbeParams::from(check);

        // A target the transport can never reach is a config bug, not a
        // probe failure; refuse to start instead of flapping forever.
        for endpoint in self.cluster.endpoints() {
            validate_probe_target(&endpoint.addr)?;
        }

        let mut handles = self
            .handles
            .lock()
            .map_err(|_| ProxyError::Internal("prober handle lock poisoned".to_string()))?;
        for endpoint in self.cluster.endpoints() {
            handles.push(tokio::spawn(probe_loop(
                self.cluster.id().to_string(),
                endpoint.clone(),
                params.clone(),
                self.transport.clone(),
                limiter.clone(),
                self.shutdown.subscribe(),
            )));
        }

        info!(
            "Started prober for cluster '{}' ({} endpoints)",
            self.cluster.id(),
            self.cluster.endpoints().len()
        );
        Ok(())
    }

    /// Signals every probe loop to stop and waits for in-flight probes to
    /// finish; nothing is aborted mid-flight. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if handles.is_empty() {
            return;
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(
                    "Probe loop of cluster '{}' ended abnormally: {e}",
                    self.cluster.id()
                );
            }
        }
        info!("Stopped prober for cluster '{}'", self.cluster.id());
    }
}

fn validate_probe_target(addr: &str) -> ProxyResult<()> {
    let port_valid = addr
        .rsplit_once(':')
        .map(|(_, port)| port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if !port_valid {
        return Err(ProxyError::InvalidProbeTarget {
            target: addr.to_string(),
            reason: "missing or invalid port".to_string(),
        });
    }
    Ok(())
}

fn jittered(interval: Duration, initial: bool) -> Duration {
    let mut rng = rand::thread_rng();
    if initial {
        // spread first probes across one interval to avoid a thundering herd
        interval.mul_f64(rng.gen_range(0.0..1.0))
    } else {
        interval.mul_f64(rng.gen_range(0.875..1.125))
    }
}

async fn probe_loop(
    cluster_id: String,
    endpoint: Arc<Endpoint>,
    params: ProbeParams,
    transport: Arc<dyn ProbeTransport>,
    limiter: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = jittered(params.interval, true);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        // Waiting here is back-pressure from the gateway-wide probe budget,
        // not an error.
        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = limiter.clone().acquire_many_owned(params.concurrency_weight) => {
                match permit {
                    Ok(permit) => permit,
                    // limiter closed, the manager is gone
                    Err(_) => break,
                }
            }
        };

        let start = Instant::now();
        let outcome = transport.check(&endpoint.addr, params.timeout).await;
        drop(permit);

        let result = ProbeResult {
            addr: endpoint.addr.clone(),
            success: outcome.is_ok(),
            latency: start.elapsed(),
            failure: outcome.err(),
        };
        debug!("Probe finished: {result:?}");

        if result.success {
            if let Some(status) = endpoint.health.record_success(params.healthy_threshold) {
                info!(
                    "Endpoint '{}' of cluster '{cluster_id}' is now {status}",
                    endpoint.addr
                );
            }
        } else if let Some(status) = endpoint.health.record_failure(params.unhealthy_threshold) {
            warn!(
                "Endpoint '{}' of cluster '{cluster_id}' is now {status}",
                endpoint.addr
            );
        }

        if *shutdown.borrow() {
            break;
        }
        delay = jittered(params.interval, false);
    }
}

/// Keeps the set of running probers in lockstep with snapshot publication
/// and owns the shared probe concurrency limiter.
pub struct ProberManager {
    probers: DashMap<String, Arc<ClusterProber>>,
    limiter: Arc<Semaphore>,
    transports: TransportFactory,
    // Serializes reconciliation so overlapping calls cannot double-start
    // a prober or displace one without stopping it.
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl ProberManager {
    /// `max_concurrent_probes` caps probe operations in flight across every
    /// cluster of this gateway instance.
    pub fn new(max_concurrent_probes: usize) -> Self {
        Self::with_transport_factory(max_concurrent_probes, Arc::new(default_transport))
    }

    pub fn with_transport_factory(
        max_concurrent_probes: usize,
        transports: TransportFactory,
    ) -> Self {
        Self {
            probers: DashMap::new(),
            limiter: Arc::new(Semaphore::new(max_concurrent_probes)),
            transports,
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn prober(&self, cluster_id: &str) -> Option<Arc<ClusterProber>> {
        self.probers.get(cluster_id).map(|p| p.value().clone())
    }

    pub fn prober_count(&self) -> usize {
        self.probers.len()
    }

    /// Reconciles running probers against a newly published snapshot:
    /// vanished or changed clusters get their prober stopped (in-flight
    /// probes drain first), new clusters with checks get one started, and
    /// unchanged clusters keep their running prober untouched.
    pub async fn apply_snapshot(&self, snapshot: &ConfigSnapshot) {
        let _guard = self.reconcile_lock.lock().await;

        let mut stale: Vec<String> = Vec::new();
        for entry in self.probers.iter() {
            match snapshot.cluster(entry.key()) {
                Some(cluster) if Arc::ptr_eq(&cluster, entry.value().cluster()) => {}
                _ => stale.push(entry.key().clone()),
            }
        }
        for id in stale {
            if let Some((_, prober)) = self.probers.remove(&id) {
                info!("Cluster '{id}' removed or changed, stopping its prober");
                prober.stop().await;
            }
        }

        for cluster in snapshot.clusters() {
            if cluster.active_check().is_none() {
                continue;
            }
            if self.probers.contains_key(cluster.id()) {
                continue;
            }
            if let Err(e) = self.start_prober(cluster.clone()) {
                // One malformed cluster must not stop probing of the others.
                error!("Failed to start prober for cluster '{}': {e}", cluster.id());
            }
        }
    }

    fn start_prober(&self, cluster: Arc<ClusterInfo>) -> ProxyResult<()> {
        let check = cluster.active_check().ok_or_else(|| {
            ProxyError::Internal("start_prober called for cluster without checks".to_string())
        })?;
        let transport = (self.transports)(check)?;

        let prober = Arc::new(ClusterProber::new(cluster, transport));
        prober.start(self.limiter.clone())?;
        self.probers
            .insert(prober.cluster_id().to_string(), prober);
        Ok(())
    }

    /// Stops every running prober concurrently and waits for all of them.
    pub async fn shutdown(&self) {
        let _guard = self.reconcile_lock.lock().await;

        let probers: Vec<Arc<ClusterProber>> = self
            .probers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.probers.clear();

        join_all(probers.iter().map(|prober| prober.stop())).await;
        info!("All probers stopped");
    }
}
