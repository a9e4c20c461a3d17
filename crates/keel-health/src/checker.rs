//! Health probe results and streak tracking.
//!
//! Performs HTTP health checks against replica endpoints and tracks
//! consecutive healthy samples for the gate.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_core::BoxFuture;

use crate::gate::{Probe, ProbeTarget};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

impl ProbeResult {
    /// Fold per-replica results into one: any Unhealthy wins, then any
    /// Failed. An empty set is Failed, since nothing was observed.
    pub fn combine(results: impl IntoIterator<Item = ProbeResult>) -> ProbeResult {
        let mut combined = None;
        for r in results {
            combined = Some(match (combined, r) {
                (_, ProbeResult::Unhealthy) | (Some(ProbeResult::Unhealthy), _) => {
                    ProbeResult::Unhealthy
                }
                (_, ProbeResult::Failed) | (Some(ProbeResult::Failed), _) => ProbeResult::Failed,
                _ => ProbeResult::Healthy,
            });
        }
        combined.unwrap_or(ProbeResult::Failed)
    }
}

/// Observed health of a probe target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl From<ProbeResult> for HealthStatus {
    fn from(r: ProbeResult) -> Self {
        match r {
            ProbeResult::Healthy => HealthStatus::Healthy,
            ProbeResult::Unhealthy => HealthStatus::Unhealthy,
            ProbeResult::Failed => HealthStatus::Unknown,
        }
    }
}

/// One observation taken by the gate. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSample {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    pub status: HealthStatus,
}

impl HealthSample {
    pub fn now(status: HealthStatus) -> Self {
        Self {
            timestamp_ms: epoch_millis(),
            status,
        }
    }
}

/// Counts consecutive healthy samples.
#[derive(Debug)]
pub struct StreakTracker {
    streak: u32,
    required: u32,
}

impl StreakTracker {
    pub fn new(required: u32) -> Self {
        Self {
            streak: 0,
            required: required.max(1),
        }
    }

    /// Record a sample; returns true once the streak reaches the requirement.
    pub fn record(&mut self, status: HealthStatus) -> bool {
        match status {
            HealthStatus::Healthy => self.streak += 1,
            HealthStatus::Unhealthy => {
                if self.streak > 0 {
                    debug!(streak = self.streak, "healthy streak reset");
                }
                self.streak = 0;
            }
            HealthStatus::Unknown => {}
        }
        self.is_confirmed()
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn is_confirmed(&self) -> bool {
        self.streak >= self.required
    }
}

/// Probes every replica address in the target over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub path: String,
    pub timeout: Duration,
}

impl HttpProbe {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            timeout,
        }
    }
}

impl Probe for HttpProbe {
    fn check<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            let mut results = Vec::with_capacity(target.replicas.len());
            for address in &target.replicas {
                results.push(http_probe(address, &self.path, self.timeout).await);
            }
            ProbeResult::combine(results)
        })
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "keel-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn tracker_confirms_after_three_healthy() {
        let mut tracker = StreakTracker::new(3);
        assert!(!tracker.record(HealthStatus::Healthy));
        assert!(!tracker.record(HealthStatus::Healthy));
        assert!(tracker.record(HealthStatus::Healthy));
        assert_eq!(tracker.streak(), 3);
    }

    #[test]
    fn unhealthy_after_two_healthy_resets_to_zero() {
        let mut tracker = StreakTracker::new(3);
        tracker.record(HealthStatus::Healthy);
        tracker.record(HealthStatus::Healthy);
        tracker.record(HealthStatus::Unhealthy);
        assert_eq!(tracker.streak(), 0);

        assert!(!tracker.record(HealthStatus::Healthy));
        assert!(!tracker.record(HealthStatus::Healthy));
        assert!(tracker.record(HealthStatus::Healthy));
    }

    #[test]
    fn unknown_neither_resets_nor_advances() {
        let mut tracker = StreakTracker::new(3);
        tracker.record(HealthStatus::Healthy);
        tracker.record(HealthStatus::Healthy);
        assert!(!tracker.record(HealthStatus::Unknown));
        assert_eq!(tracker.streak(), 2);
        assert!(!tracker.record(HealthStatus::Unknown));
        assert!(tracker.record(HealthStatus::Healthy));
    }

    #[test]
    fn zero_requirement_still_needs_one_sample() {
        let mut tracker = StreakTracker::new(0);
        assert!(!tracker.is_confirmed());
        assert!(tracker.record(HealthStatus::Healthy));
    }

    #[test]
    fn combine_results() {
        use ProbeResult::*;
        assert_eq!(ProbeResult::combine([Healthy, Healthy]), Healthy);
        assert_eq!(ProbeResult::combine([Healthy, Failed]), Failed);
        assert_eq!(ProbeResult::combine([Failed, Unhealthy, Healthy]), Unhealthy);
        assert_eq!(ProbeResult::combine([]), Failed);
    }

    #[test]
    fn probe_result_maps_to_status() {
        assert_eq!(HealthStatus::from(ProbeResult::Failed), HealthStatus::Unknown);
        assert_eq!(HealthStatus::from(ProbeResult::Unhealthy), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_returns_failed() {
        let result = http_probe("127.0.0.1:1", "/healthz", Duration::from_millis(100)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn http_probe_2xx_is_healthy() {
        let addr = serve_once("HTTP/1.1 200 OK").await;
        let result = http_probe(&addr, "/healthz", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn http_probe_5xx_is_unhealthy() {
        let addr = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let result = http_probe(&addr, "/healthz", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_checks_every_replica() {
        let healthy = serve_once("HTTP/1.1 200 OK").await;
        let probe = HttpProbe::new("/healthz", Duration::from_millis(500));
        let target = ProbeTarget::replicas("web", vec![healthy, "127.0.0.1:1".to_string()]);
        assert_eq!(probe.check(&target).await, ProbeResult::Failed);
    }
}
