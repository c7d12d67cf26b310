//! Metrics collection using metrics-rs.

use metrics::{Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const REGIONS_CREATED: &str = "ashfile_regions_created";
const REGIONS_DESTROYED: &str = "ashfile_regions_destroyed";
const PAGES_PURGED: &str = "ashfile_pages_purged";
const HANDOFFS_PUBLISHED: &str = "ashfile_handoffs_published";
const HANDOFFS_CLAIMED: &str = "ashfile_handoffs_claimed";
const REQUESTS_FAILED: &str = "ashfile_requests_failed";
const BYTES_ALLOCATED: &str = "ashfile_bytes_allocated";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(REGIONS_CREATED, Unit::Count, "Regions allocated");
    metrics::describe_counter!(
        REGIONS_DESTROYED,
        Unit::Count,
        "Regions destroyed after their last handle was dropped"
    );
    metrics::describe_counter!(PAGES_PURGED, Unit::Count, "Backing pages discarded by purge");
    metrics::describe_counter!(HANDOFFS_PUBLISHED, Unit::Count, "Regions offered for handoff");
    metrics::describe_counter!(
        HANDOFFS_CLAIMED,
        Unit::Count,
        "Handles installed by a successful claim"
    );
    metrics::describe_counter!(
        REQUESTS_FAILED,
        Unit::Count,
        "Control-device requests that returned an error"
    );
    metrics::describe_gauge!(BYTES_ALLOCATED, Unit::Bytes, "Bytes of backing pages in use");
}

/// Record a region allocation.
#[inline]
pub fn record_region_created(bytes_allocated: usize) {
    counter!(REGIONS_CREATED).increment(1);
    gauge!(BYTES_ALLOCATED).set(bytes_allocated as f64);
}

/// Record a region destruction.
#[inline]
pub fn record_region_destroyed(bytes_allocated: usize) {
    counter!(REGIONS_DESTROYED).increment(1);
    gauge!(BYTES_ALLOCATED).set(bytes_allocated as f64);
}

/// Record pages discarded by a purge.
#[inline]
pub fn record_pages_purged(pages: usize) {
    if pages > 0 {
        counter!(PAGES_PURGED).increment(pages as u64);
    }
}

/// Record a publish.
#[inline]
pub fn record_published() {
    counter!(HANDOFFS_PUBLISHED).increment(1);
}

/// Record a successful claim.
#[inline]
pub fn record_claimed() {
    counter!(HANDOFFS_CLAIMED).increment(1);
}

/// Record a failed control request.
#[inline]
pub fn record_request_failed(command: &'static str, errno: i32) {
    counter!(REQUESTS_FAILED, "command" => command, "errno" => errno.to_string()).increment(1);
}
