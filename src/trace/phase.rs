use crate::trace::metrics::TracingMetrics;
use crate::trace::summary::PhaseSummary;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// One callback per phase boundary of an outbound request's network
/// lifecycle. The host client invokes these at the matching points; the
/// causal order of start/done pairs is the host's responsibility.
///
/// Hooks never fail and never block.
pub trait PhaseHooks: Send + Sync {
    fn on_connection_acquire_start(&self);
    fn on_connection_acquired(&self, reused: bool, was_idle: bool);
    fn on_dns_start(&self, host: &str);
    fn on_dns_done(&self, coalesced: bool);
    fn on_connect_start(&self);
    fn on_connect_done(&self, error: Option<&str>);
    fn on_tls_handshake_start(&self);
    fn on_tls_handshake_done(&self);
    fn on_headers_written(&self);
    fn on_request_written(&self);
    fn on_first_response_byte(&self);
}

/// Hook set that records nothing, for requests sent without decoration.
pub struct NoopHooks;

impl PhaseHooks for NoopHooks {
    fn on_connection_acquire_start(&self) {}
    fn on_connection_acquired(&self, _reused: bool, _was_idle: bool) {}
    fn on_dns_start(&self, _host: &str) {}
    fn on_dns_done(&self, _coalesced: bool) {}
    fn on_connect_start(&self) {}
    fn on_connect_done(&self, _error: Option<&str>) {}
    fn on_tls_handshake_start(&self) {}
    fn on_tls_handshake_done(&self) {}
    fn on_headers_written(&self) {}
    fn on_request_written(&self) {}
    fn on_first_response_byte(&self) {}
}

#[derive(Default)]
struct PhaseState {
    conn_acquire_start: Option<Instant>,
    dns_start: Option<Instant>,
    dns_host: Option<String>,
    connect_start: Option<Instant>,
    tls_start: Option<Instant>,
    summary: PhaseSummary,
}

/// Per-request translation of lifecycle events into metric updates.
///
/// Holds the start timestamp of each in-flight phase; every "done" hook
/// observes the elapsed time into the shared [`TracingMetrics`]. A done
/// hook whose start was never recorded skips the observation, so no
/// negative or garbage duration ever reaches a histogram.
///
/// One instance belongs to exactly one request and is dropped with it.
/// The metrics store it points at is shared across all in-flight
/// requests.
pub struct PhaseTracer {
    request_start: Instant,
    method: String,
    host: String,
    metrics: Arc<TracingMetrics>,
    state: Mutex<PhaseState>,
}

impl PhaseTracer {
    pub fn new(
        request_start: Instant,
        metrics: Arc<TracingMetrics>,
        method: String,
        host: String,
    ) -> Self {
        Self {
            request_start,
            method,
            host,
            metrics,
            state: Mutex::new(PhaseState::default()),
        }
    }

    /// Durations recorded so far, for the `--time` breakdown.
    pub fn summary(&self) -> PhaseSummary {
        self.state
            .lock()
            .map(|s| s.summary.clone())
            .unwrap_or_default()
    }
}

impl PhaseHooks for PhaseTracer {
    fn on_connection_acquire_start(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.conn_acquire_start = Some(Instant::now());
        }
    }

    fn on_connection_acquired(&self, reused: bool, was_idle: bool) {
        if let Ok(mut s) = self.state.lock() {
            match s.conn_acquire_start.take() {
                Some(start) => {
                    s.summary.connection_acquire = Some(start.elapsed());
                    self.metrics
                        .observe_connection_acquire(start, &self.method, &self.host);
                }
                None => trace!("connection acquired without a matching start, skipping"),
            }
        }
        if reused {
            self.metrics.inc_reused_connection();
        }
        if was_idle {
            self.metrics.inc_reused_idle_connection();
        }
    }

    fn on_dns_start(&self, host: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.dns_start = Some(Instant::now());
            s.dns_host = Some(host.to_string());
        }
    }

    fn on_dns_done(&self, coalesced: bool) {
        if let Ok(mut s) = self.state.lock() {
            let host = s.dns_host.take().unwrap_or_else(|| self.host.clone());
            match s.dns_start.take() {
                Some(start) => {
                    s.summary.dns = Some(start.elapsed());
                    self.metrics.observe_dns_lookup(start, &host);
                }
                None => trace!("DNS done without a matching start, skipping"),
            }
            if coalesced {
                self.metrics.inc_dns_coalesced(&host);
            }
        }
    }

    fn on_connect_start(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.connect_start = Some(Instant::now());
        }
    }

    fn on_connect_done(&self, error: Option<&str>) {
        // The handshake duration is observed whether or not the connect
        // succeeded; failures additionally bump the error counter.
        if let Ok(mut s) = self.state.lock() {
            match s.connect_start.take() {
                Some(start) => {
                    s.summary.tcp_connect = Some(start.elapsed());
                    self.metrics
                        .observe_connection_handshake(start, &self.method, &self.host);
                }
                None => trace!("connect done without a matching start, skipping"),
            }
        }
        if let Some(e) = error {
            debug!("connect to {} failed: {}", self.host, e);
            self.metrics.inc_connect_error(&self.host);
        }
    }

    fn on_tls_handshake_start(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.tls_start = Some(Instant::now());
        }
    }

    fn on_tls_handshake_done(&self) {
        if let Ok(mut s) = self.state.lock() {
            match s.tls_start.take() {
                Some(start) => {
                    s.summary.tls_handshake = Some(start.elapsed());
                    self.metrics
                        .observe_tls_handshake(start, &self.method, &self.host);
                }
                None => trace!("TLS handshake done without a matching start, skipping"),
            }
        }
    }

    fn on_headers_written(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.summary.header_write = Some(self.request_start.elapsed());
        }
        self.metrics
            .observe_header_write(self.request_start, &self.method, &self.host);
    }

    fn on_request_written(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.summary.request_write = Some(self.request_start.elapsed());
        }
        self.metrics
            .observe_request_write(self.request_start, &self.method, &self.host);
    }

    fn on_first_response_byte(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.summary.first_byte = Some(self.request_start.elapsed());
        }
        self.metrics
            .observe_first_byte(self.request_start, &self.method, &self.host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::metrics::LabelKeys;
    use prometheus::core::Collector;
    use std::time::Duration;

    fn tracer_for(method: &str, host: &str) -> (Arc<TracingMetrics>, PhaseTracer) {
        let metrics = Arc::new(TracingMetrics::new("test", &LabelKeys::default()).unwrap());
        let tracer = PhaseTracer::new(
            Instant::now(),
            metrics.clone(),
            method.to_string(),
            host.to_string(),
        );
        (metrics, tracer)
    }

    fn acquire_count(m: &TracingMetrics, method: &str, host: &str) -> u64 {
        m.collectors()[0]
            .collect()
            .iter()
            .flat_map(|family| family.get_metric().iter())
            .filter(|metric| {
                metric.get_label().iter().any(|l| l.get_value() == method)
                    && metric.get_label().iter().any(|l| l.get_value() == host)
            })
            .map(|metric| metric.get_histogram().get_sample_count())
            .sum()
    }

    #[test]
    fn acquisition_delay_is_observed_without_reuse_counters() {
        let (metrics, tracer) = tracer_for("GET", "example.com");

        tracer.on_connection_acquire_start();
        std::thread::sleep(Duration::from_millis(20));
        tracer.on_connection_acquired(false, false);

        assert_eq!(acquire_count(&metrics, "GET", "example.com"), 1);
        let summary = tracer.summary();
        let acquired = summary.connection_acquire.unwrap();
        assert!(acquired >= Duration::from_millis(20));
        assert!(acquired < Duration::from_secs(5));

        let registry = prometheus::Registry::new();
        for c in metrics.collectors() {
            registry.register(c).unwrap();
        }
        for family in registry.gather() {
            if family.get_name().contains("reuse") {
                assert_eq!(family.get_metric()[0].get_counter().get_value(), 0.0);
            }
        }
    }

    #[test]
    fn reuse_flags_drive_the_counters() {
        let (metrics, tracer) = tracer_for("GET", "example.com");

        tracer.on_connection_acquire_start();
        tracer.on_connection_acquired(true, false);
        tracer.on_connection_acquire_start();
        tracer.on_connection_acquired(true, true);

        let registry = prometheus::Registry::new();
        for c in metrics.collectors() {
            registry.register(c).unwrap();
        }
        let value = |name: &str| {
            registry
                .gather()
                .iter()
                .find(|f| f.get_name() == name)
                .map(|f| f.get_metric()[0].get_counter().get_value())
                .unwrap()
        };
        assert_eq!(value("test_http_reuse_connections"), 2.0);
        assert_eq!(value("test_http_reuse_idle_connections"), 1.0);
    }

    #[test]
    fn dns_lookup_is_labeled_by_host_and_coalesced_counts() {
        let (metrics, tracer) = tracer_for("GET", "example.com");

        tracer.on_dns_start("example.com");
        tracer.on_dns_done(true);

        let registry = prometheus::Registry::new();
        for c in metrics.collectors() {
            registry.register(c).unwrap();
        }
        let families = registry.gather();

        let dns = families
            .iter()
            .find(|f| f.get_name() == "test_http_dns_lookup_duration_seconds")
            .unwrap();
        assert_eq!(dns.get_metric()[0].get_label()[0].get_value(), "example.com");
        assert_eq!(dns.get_metric()[0].get_histogram().get_sample_count(), 1);

        let coalesced = families
            .iter()
            .find(|f| f.get_name() == "test_http_dns_coalesced_queries_counter")
            .unwrap();
        assert_eq!(
            coalesced.get_metric()[0].get_label()[0].get_value(),
            "example.com"
        );
        assert_eq!(coalesced.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[test]
    fn done_without_start_is_a_deterministic_skip() {
        let (metrics, tracer) = tracer_for("GET", "example.com");

        tracer.on_connection_acquired(false, false);
        tracer.on_dns_done(false);
        tracer.on_connect_done(None);
        tracer.on_tls_handshake_done();

        assert_eq!(acquire_count(&metrics, "GET", "example.com"), 0);
        let summary = tracer.summary();
        assert!(summary.connection_acquire.is_none());
        assert!(summary.dns.is_none());
        assert!(summary.tcp_connect.is_none());
        assert!(summary.tls_handshake.is_none());
    }

    #[test]
    fn connect_error_still_observes_duration_and_counts() {
        let (metrics, tracer) = tracer_for("GET", "example.com");

        tracer.on_connect_start();
        tracer.on_connect_done(Some("connection refused"));

        let registry = prometheus::Registry::new();
        for c in metrics.collectors() {
            registry.register(c).unwrap();
        }
        let families = registry.gather();

        let handshake = families
            .iter()
            .find(|f| f.get_name() == "test_http_connection_handshake_duration_seconds")
            .unwrap();
        assert_eq!(handshake.get_metric()[0].get_histogram().get_sample_count(), 1);

        let errors = families
            .iter()
            .find(|f| f.get_name() == "test_http_connect_errors_counter")
            .unwrap();
        assert_eq!(errors.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[test]
    fn request_relative_phases_record_from_request_start() {
        let (metrics, tracer) = tracer_for("POST", "example.com");

        tracer.on_headers_written();
        tracer.on_request_written();
        tracer.on_first_response_byte();

        let registry = prometheus::Registry::new();
        for c in metrics.collectors() {
            registry.register(c).unwrap();
        }
        for name in [
            "test_http_header_write_duration_seconds",
            "test_http_request_write_duration_seconds",
            "test_http_first_byte_response_duration_seconds",
        ] {
            let family = registry
                .gather()
                .into_iter()
                .find(|f| f.get_name() == name)
                .unwrap();
            assert_eq!(family.get_metric()[0].get_histogram().get_sample_count(), 1);
        }

        let summary = tracer.summary();
        assert!(summary.header_write.is_some());
        assert!(summary.request_write.is_some());
        assert!(summary.first_byte.is_some());
    }

    #[test]
    fn interleaved_tracers_do_not_share_timestamps() {
        let metrics = Arc::new(TracingMetrics::new("test", &LabelKeys::default()).unwrap());
        let a = PhaseTracer::new(
            Instant::now(),
            metrics.clone(),
            String::from("GET"),
            String::from("a.example.com"),
        );
        let b = PhaseTracer::new(
            Instant::now(),
            metrics.clone(),
            String::from("GET"),
            String::from("b.example.com"),
        );

        a.on_connection_acquire_start();
        std::thread::sleep(Duration::from_millis(15));
        b.on_connection_acquire_start();
        a.on_connection_acquired(false, false);
        b.on_connection_acquired(false, false);

        assert_eq!(acquire_count(&metrics, "GET", "a.example.com"), 1);
        assert_eq!(acquire_count(&metrics, "GET", "b.example.com"), 1);

        // B started 15ms after A; its acquisition must not inherit A's start.
        let a_acquire = a.summary().connection_acquire.unwrap();
        let b_acquire = b.summary().connection_acquire.unwrap();
        assert!(a_acquire >= Duration::from_millis(15));
        assert!(b_acquire < a_acquire);
    }
}
