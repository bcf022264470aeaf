use prometheus::core::Collector;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};
use std::time::Instant;

/// Bucket boundaries for the phase histograms. Network phases are
/// usually sub-second, so the buckets lean heavily toward small values.
pub const SMALL_DURATION_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.05, 0.1, 1.0, 2.5, 5.0, 10.0,
];

/// Label key names used on the phase collectors, passed as data instead
/// of process-wide constants so embedders can rename them.
#[derive(Debug, Clone)]
pub struct LabelKeys {
    pub method: String,
    pub host: String,
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self {
            method: String::from("method"),
            host: String::from("host"),
        }
    }
}

/// One collector per traced phase of an outbound HTTP request.
///
/// The set is immutable after construction; individual counters and
/// histograms are updated concurrently by any number of in-flight
/// requests. Updates never fail and never block.
///
/// Per-request histograms are labeled by method and host. The request
/// URL is deliberately not a label: an unbounded URL set would grow the
/// label space without limit.
pub struct TracingMetrics {
    get_connection_duration_seconds: HistogramVec,
    reuse_connections: IntCounter,
    reuse_idle_connections: IntCounter,
    first_byte_duration_seconds: HistogramVec,
    dns_lookup_duration_seconds: HistogramVec,
    dns_coalesced_queries: IntCounterVec,
    connection_handshake_duration_seconds: HistogramVec,
    tls_handshake_duration_seconds: HistogramVec,
    header_write_duration_seconds: HistogramVec,
    request_write_duration_seconds: HistogramVec,
    connect_errors: IntCounterVec,
}

impl TracingMetrics {
    pub fn new(namespace: &str, labels: &LabelKeys) -> Result<Self, prometheus::Error> {
        let request_labels = [labels.method.as_str(), labels.host.as_str()];
        let host_labels = [labels.host.as_str()];

        let histogram = |name: &str, help: &str| {
            HistogramOpts::new(name, help)
                .namespace(namespace.to_string())
                .buckets(SMALL_DURATION_BUCKETS.to_vec())
        };
        let counter = |name: &str, help: &str| Opts::new(name, help).namespace(namespace.to_string());

        Ok(Self {
            get_connection_duration_seconds: HistogramVec::new(
                histogram(
                    "http_get_connection_duration_seconds",
                    "HTTP Get Connection Duration",
                ),
                &request_labels,
            )?,
            reuse_connections: IntCounter::with_opts(counter(
                "http_reuse_connections",
                "HTTP Connection Re-use Counter",
            ))?,
            reuse_idle_connections: IntCounter::with_opts(counter(
                "http_reuse_idle_connections",
                "HTTP Idle Connection Re-use Counter",
            ))?,
            first_byte_duration_seconds: HistogramVec::new(
                histogram(
                    "http_first_byte_response_duration_seconds",
                    "HTTP Duration of Getting First Response Bytes",
                ),
                &request_labels,
            )?,
            dns_lookup_duration_seconds: HistogramVec::new(
                histogram("http_dns_lookup_duration_seconds", "HTTP DNS Lookup Duration"),
                &host_labels,
            )?,
            dns_coalesced_queries: IntCounterVec::new(
                counter(
                    "http_dns_coalesced_queries_counter",
                    "HTTP DNS Query Coalesced Counter",
                ),
                &host_labels,
            )?,
            connection_handshake_duration_seconds: HistogramVec::new(
                histogram(
                    "http_connection_handshake_duration_seconds",
                    "HTTP Connection Handshake Duration",
                ),
                &request_labels,
            )?,
            tls_handshake_duration_seconds: HistogramVec::new(
                histogram(
                    "http_tls_handshake_duration_seconds",
                    "HTTP TLS Handshake Duration",
                ),
                &request_labels,
            )?,
            header_write_duration_seconds: HistogramVec::new(
                histogram(
                    "http_header_write_duration_seconds",
                    "HTTP Header Write Duration",
                ),
                &request_labels,
            )?,
            request_write_duration_seconds: HistogramVec::new(
                histogram(
                    "http_request_write_duration_seconds",
                    "HTTP Request Write Duration",
                ),
                &request_labels,
            )?,
            connect_errors: IntCounterVec::new(
                counter("http_connect_errors_counter", "HTTP Connect Error Counter"),
                &host_labels,
            )?,
        })
    }

    pub fn observe_connection_acquire(&self, start: Instant, method: &str, host: &str) {
        self.get_connection_duration_seconds
            .with_label_values(&[method, host])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn inc_reused_connection(&self) {
        self.reuse_connections.inc();
    }

    pub fn inc_reused_idle_connection(&self) {
        self.reuse_idle_connections.inc();
    }

    pub fn observe_first_byte(&self, start: Instant, method: &str, host: &str) {
        self.first_byte_duration_seconds
            .with_label_values(&[method, host])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn observe_dns_lookup(&self, start: Instant, host: &str) {
        self.dns_lookup_duration_seconds
            .with_label_values(&[host])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn inc_dns_coalesced(&self, host: &str) {
        self.dns_coalesced_queries.with_label_values(&[host]).inc();
    }

    pub fn observe_connection_handshake(&self, start: Instant, method: &str, host: &str) {
        self.connection_handshake_duration_seconds
            .with_label_values(&[method, host])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn observe_tls_handshake(&self, start: Instant, method: &str, host: &str) {
        self.tls_handshake_duration_seconds
            .with_label_values(&[method, host])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn observe_header_write(&self, start: Instant, method: &str, host: &str) {
        self.header_write_duration_seconds
            .with_label_values(&[method, host])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn observe_request_write(&self, start: Instant, method: &str, host: &str) {
        self.request_write_duration_seconds
            .with_label_values(&[method, host])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn inc_connect_error(&self, host: &str) {
        self.connect_errors.with_label_values(&[host]).inc();
    }

    /// Every collector owned by this store, each exactly once, for
    /// registration with an external registry.
    pub fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.get_connection_duration_seconds.clone()),
            Box::new(self.reuse_connections.clone()),
            Box::new(self.reuse_idle_connections.clone()),
            Box::new(self.first_byte_duration_seconds.clone()),
            Box::new(self.dns_lookup_duration_seconds.clone()),
            Box::new(self.dns_coalesced_queries.clone()),
            Box::new(self.connection_handshake_duration_seconds.clone()),
            Box::new(self.tls_handshake_duration_seconds.clone()),
            Box::new(self.header_write_duration_seconds.clone()),
            Box::new(self.request_write_duration_seconds.clone()),
            Box::new(self.connect_errors.clone()),
        ]
    }
}
