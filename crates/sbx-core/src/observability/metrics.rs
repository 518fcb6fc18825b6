use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::QuotaKind;

/// Latency buckets shared by every duration histogram.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics handle holding its own registry.
///
/// Constructed once at service start and passed down; there is no global
/// registry. `render` produces the text exposition for `GET /metrics`.
pub struct Metrics {
    registry: Registry,

    pub sandbox_created_total: IntCounter,
    pub sandbox_active: IntGauge,
    pub sandbox_exec_total: IntCounterVec,
    pub sandbox_exec_duration_seconds: Histogram,

    pub snapshot_created_total: IntCounter,
    pub snapshot_restored_total: IntCounter,
    pub snapshot_size_bytes: Histogram,

    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: Histogram,

    pub quota_violations_total: IntCounterVec,
    pub preview_proxy_in_flight: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sandbox_created_total =
            IntCounter::with_opts(Opts::new("sandbox_created_total", "Sandboxes created"))?;
        let sandbox_active =
            IntGauge::with_opts(Opts::new("sandbox_active", "Sandboxes currently alive"))?;
        let sandbox_exec_total = IntCounterVec::new(
            Opts::new("sandbox_exec_total", "Commands executed in sandboxes"),
            &["sandbox", "command"],
        )?;
        let sandbox_exec_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sandbox_exec_duration_seconds",
                "Wall-clock duration of sandbox exec calls",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;

        let snapshot_created_total =
            IntCounter::with_opts(Opts::new("snapshot_created_total", "Snapshots created"))?;
        let snapshot_restored_total =
            IntCounter::with_opts(Opts::new("snapshot_restored_total", "Snapshots restored"))?;
        // Powers of two, 4 KiB through 1 GiB.
        let snapshot_size_bytes = Histogram::with_opts(
            HistogramOpts::new("snapshot_size_bytes", "Compressed snapshot payload size")
                .buckets(prometheus::exponential_buckets(4096.0, 2.0, 19)?),
        )?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests served"),
            &["method", "path", "status"],
        )?;
        let http_request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;

        let quota_violations_total = IntCounterVec::new(
            Opts::new("quota_violations_total", "Rejected quota admissions"),
            &["kind"],
        )?;
        let preview_proxy_in_flight = IntGauge::with_opts(Opts::new(
            "preview_proxy_in_flight",
            "Preview requests currently being proxied",
        ))?;

        registry.register(Box::new(sandbox_created_total.clone()))?;
        registry.register(Box::new(sandbox_active.clone()))?;
        registry.register(Box::new(sandbox_exec_total.clone()))?;
        registry.register(Box::new(sandbox_exec_duration_seconds.clone()))?;
        registry.register(Box::new(snapshot_created_total.clone()))?;
        registry.register(Box::new(snapshot_restored_total.clone()))?;
        registry.register(Box::new(snapshot_size_bytes.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(quota_violations_total.clone()))?;
        registry.register(Box::new(preview_proxy_in_flight.clone()))?;

        Ok(Self {
            registry,
            sandbox_created_total,
            sandbox_active,
            sandbox_exec_total,
            sandbox_exec_duration_seconds,
            snapshot_created_total,
            snapshot_restored_total,
            snapshot_size_bytes,
            http_requests_total,
            http_request_duration_seconds,
            quota_violations_total,
            preview_proxy_in_flight,
        })
    }

    pub fn record_quota_violation(&self, kind: QuotaKind) {
        self.quota_violations_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_construct_and_render() {
        let m = Metrics::new().unwrap();
        m.sandbox_created_total.inc();
        m.sandbox_active.set(3);

        let text = m.render();
        assert!(text.contains("# HELP sandbox_created_total"));
        assert!(text.contains("# TYPE sandbox_created_total counter"));
        assert!(text.contains("sandbox_created_total 1"));
        assert!(text.contains("sandbox_active 3"));
    }

    #[test]
    fn test_labeled_counters() {
        let m = Metrics::new().unwrap();
        m.sandbox_exec_total
            .with_label_values(&["sbx-4f2a91aabbcc", "echo"])
            .inc();
        m.http_requests_total
            .with_label_values(&["POST", "/sandboxes", "200"])
            .inc();

        let text = m.render();
        assert!(text.contains(r#"sandbox_exec_total{command="echo",sandbox="sbx-4f2a91aabbcc"} 1"#));
        assert!(text.contains(r#"http_requests_total{method="POST",path="/sandboxes",status="200"} 1"#));
    }

    #[test]
    fn test_quota_violation_labels() {
        let m = Metrics::new().unwrap();
        m.record_quota_violation(QuotaKind::ConcurrentExec);
        m.record_quota_violation(QuotaKind::ConcurrentExec);
        m.record_quota_violation(QuotaKind::Storage);

        let text = m.render();
        assert!(text.contains(r#"quota_violations_total{kind="concurrent_exec"} 2"#));
        assert!(text.contains(r#"quota_violations_total{kind="storage"} 1"#));
    }

    #[test]
    fn test_exec_duration_histogram_buckets() {
        let m = Metrics::new().unwrap();
        m.sandbox_exec_duration_seconds.observe(0.02);

        let text = m.render();
        assert!(text.contains("# TYPE sandbox_exec_duration_seconds histogram"));
        assert!(text.contains(r#"sandbox_exec_duration_seconds_bucket{le="0.025"} 1"#));
        assert!(text.contains(r#"sandbox_exec_duration_seconds_bucket{le="0.01"} 0"#));
    }

    #[test]
    fn test_snapshot_size_buckets_are_powers_of_two() {
        let m = Metrics::new().unwrap();
        m.snapshot_size_bytes.observe(5000.0);

        let text = m.render();
        // 4 KiB and 8 KiB boundaries present; 5000 lands in the 8192 bucket.
        assert!(text.contains(r#"snapshot_size_bytes_bucket{le="4096"} 0"#));
        assert!(text.contains(r#"snapshot_size_bytes_bucket{le="8192"} 1"#));
        // Top bucket is 1 GiB.
        assert!(text.contains(r#"le="1073741824""#));
    }

    #[test]
    fn test_in_flight_gauge_up_down() {
        let m = Metrics::new().unwrap();
        m.preview_proxy_in_flight.inc();
        m.preview_proxy_in_flight.inc();
        m.preview_proxy_in_flight.dec();
        assert_eq!(m.preview_proxy_in_flight.get(), 1);
    }
}
