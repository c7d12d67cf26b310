//! Observability features: metrics and tracing.
//!
//! - **Metrics**: counters and gauges via `metrics-rs`
//! - **Tracing**: structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `ashfile_regions_created` | Counter | Regions allocated |
//! | `ashfile_regions_destroyed` | Counter | Regions destroyed |
//! | `ashfile_pages_purged` | Counter | Backing pages discarded by purge |
//! | `ashfile_handoffs_published` | Counter | Regions offered for handoff |
//! | `ashfile_handoffs_claimed` | Counter | Successful claims |
//! | `ashfile_requests_failed` | Counter | Failed control requests, by command and errno |
//! | `ashfile_bytes_allocated` | Gauge | Bytes of backing pages in use |
//!
//! Nothing is recorded unless the application installs a metrics recorder.

mod metrics;
mod tracing_support;

pub use self::metrics::{
    init_metrics, record_claimed, record_pages_purged, record_published, record_region_created,
    record_region_destroyed, record_request_failed,
};
pub use tracing_support::{TracingConfig, span_reclaim, span_request, trace_rejected};
