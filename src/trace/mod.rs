pub mod metrics;
pub mod phase;
pub mod summary;
pub mod tracer;
