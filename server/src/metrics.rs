//! Metrics Collection for the FdxTunnel server
//!
//! Atomic counters for call outcomes and tunnel lifecycle, a latency
//! histogram for answered calls, and a Prometheus-compatible rendering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Server-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    calls_total: AtomicU64,
    calls_ok: AtomicU64,
    calls_timed_out: AtomicU64,
    calls_target_not_found: AtomicU64,
    calls_connection_closed: AtomicU64,
    /// Responses whose request id had no waiting caller
    unmatched_responses: AtomicU64,
    decode_errors: AtomicU64,
    active_tunnels: AtomicU64,
    /// Latency of answered calls
    latencies: Mutex<LatencyHistogram>,
}

/// Outcome of a single call, as counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    TimedOut,
    TargetNotFound,
    ConnectionClosed,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    /// Write position
    pos: usize,
    /// Total count
    count: u64,
    /// Sum for average
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum = self.sum.saturating_add(latency_us);
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted: Vec<u64> = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                calls_total: AtomicU64::new(0),
                calls_ok: AtomicU64::new(0),
                calls_timed_out: AtomicU64::new(0),
                calls_target_not_found: AtomicU64::new(0),
                calls_connection_closed: AtomicU64::new(0),
                unmatched_responses: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
                active_tunnels: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// Record a finished call
    pub async fn record_call(&self, outcome: CallOutcome, latency_us: u64) {
        self.inner.calls_total.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            CallOutcome::Ok => &self.inner.calls_ok,
            CallOutcome::TimedOut => &self.inner.calls_timed_out,
            CallOutcome::TargetNotFound => &self.inner.calls_target_not_found,
            CallOutcome::ConnectionClosed => &self.inner.calls_connection_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if outcome == CallOutcome::Ok {
            self.inner.latencies.lock().await.record(latency_us);
        }
    }

    pub fn unmatched_response(&self) {
        self.inner.unmatched_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.inner.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment active tunnel count
    pub fn tunnel_opened(&self) {
        self.inner.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active tunnel count
    pub fn tunnel_closed(&self) {
        self.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_tunnels(&self) -> u64 {
        self.inner.active_tunnels.load(Ordering::Relaxed)
    }

    pub fn unmatched_responses(&self) -> u64 {
        self.inner.unmatched_responses.load(Ordering::Relaxed)
    }

    pub fn calls(&self, outcome: CallOutcome) -> u64 {
        let counter = match outcome {
            CallOutcome::Ok => &self.inner.calls_ok,
            CallOutcome::TimedOut => &self.inner.calls_timed_out,
            CallOutcome::TargetNotFound => &self.inner.calls_target_not_found,
            CallOutcome::ConnectionClosed => &self.inner.calls_connection_closed,
        };
        counter.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        format!(
r#"# HELP fdxtunnel_calls_total Total number of tunnel calls issued
# TYPE fdxtunnel_calls_total counter
fdxtunnel_calls_total {}

# HELP fdxtunnel_calls_by_outcome Tunnel calls by outcome
# TYPE fdxtunnel_calls_by_outcome counter
fdxtunnel_calls_by_outcome{{outcome="ok"}} {}
fdxtunnel_calls_by_outcome{{outcome="timeout"}} {}
fdxtunnel_calls_by_outcome{{outcome="target_not_found"}} {}
fdxtunnel_calls_by_outcome{{outcome="connection_closed"}} {}

# HELP fdxtunnel_unmatched_responses_total Responses dropped for lack of a waiting call
# TYPE fdxtunnel_unmatched_responses_total counter
fdxtunnel_unmatched_responses_total {}

# HELP fdxtunnel_decode_errors_total Malformed frames skipped
# TYPE fdxtunnel_decode_errors_total counter
fdxtunnel_decode_errors_total {}

# HELP fdxtunnel_active_tunnels Number of active tunnel connections
# TYPE fdxtunnel_active_tunnels gauge
fdxtunnel_active_tunnels {}

# HELP fdxtunnel_call_latency_us Call latency in microseconds
# TYPE fdxtunnel_call_latency_us summary
fdxtunnel_call_latency_us{{quantile="0.5"}} {}
fdxtunnel_call_latency_us{{quantile="0.95"}} {}
fdxtunnel_call_latency_us{{quantile="0.99"}} {}
fdxtunnel_call_latency_us_avg {}
"#,
            self.inner.calls_total.load(Ordering::Relaxed),
            self.inner.calls_ok.load(Ordering::Relaxed),
            self.inner.calls_timed_out.load(Ordering::Relaxed),
            self.inner.calls_target_not_found.load(Ordering::Relaxed),
            self.inner.calls_connection_closed.load(Ordering::Relaxed),
            self.inner.unmatched_responses.load(Ordering::Relaxed),
            self.inner.decode_errors.load(Ordering::Relaxed),
            self.inner.active_tunnels.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
