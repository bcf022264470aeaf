use crate::trace::metrics::{LabelKeys, TracingMetrics};
use crate::trace::phase::{PhaseHooks, PhaseTracer};
use http::Request;
use prometheus::Registry;
use std::sync::Arc;
use std::time::Instant;

/// Per-request trace handle carried in a decorated request's
/// extensions. The host client pulls this out and invokes the hook set
/// at each phase boundary.
#[derive(Clone)]
pub struct RequestTrace(Arc<PhaseTracer>);

impl RequestTrace {
    pub fn hooks(&self) -> Arc<dyn PhaseHooks> {
        self.0.clone()
    }

    pub fn tracer(&self) -> &PhaseTracer {
        &self.0
    }
}

/// Entry point for instrumenting outbound requests.
///
/// Construction builds the metrics store and registers every collector;
/// a duplicate registration (same namespace registered twice) is a
/// configuration error and fails construction. Decoration is per
/// request and cannot fail.
pub struct Tracer {
    metrics: Arc<TracingMetrics>,
}

impl Tracer {
    /// Registers the phase collectors with the process-wide default
    /// registry.
    pub fn new(namespace: &str) -> Result<Self, anyhow::Error> {
        Self::with_registry(namespace, prometheus::default_registry())
    }

    pub fn with_registry(namespace: &str, registry: &Registry) -> Result<Self, anyhow::Error> {
        Self::with_config(namespace, registry, &LabelKeys::default())
    }

    pub fn with_config(
        namespace: &str,
        registry: &Registry,
        labels: &LabelKeys,
    ) -> Result<Self, anyhow::Error> {
        let metrics = TracingMetrics::new(namespace, labels)?;
        for collector in metrics.collectors() {
            registry.register(collector)?;
        }
        Ok(Self {
            metrics: Arc::new(metrics),
        })
    }

    pub fn metrics(&self) -> Arc<TracingMetrics> {
        self.metrics.clone()
    }

    /// Returns the request with a fresh [`PhaseTracer`] attached to its
    /// extensions. Each call produces an independent trace; nothing is
    /// shared between two decorated requests except the metrics store.
    pub fn decorate<B>(&self, mut request: Request<B>) -> Request<B> {
        let method = request.method().as_str().to_string();
        let host = request.uri().host().unwrap_or_default().to_string();
        let phase = PhaseTracer::new(Instant::now(), self.metrics.clone(), method, host);
        request.extensions_mut().insert(RequestTrace(Arc::new(phase)));
        request
    }
}
