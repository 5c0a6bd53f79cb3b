//! Metrics registration for the transfer engine.
//!
//! The crate records through the `metrics` facade only; installing an exporter
//! (Prometheus or otherwise) is up to the embedding application. Call
//! [`register_metrics`] once at startup to attach descriptions.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use tracing::info;

/// Register all metrics with their descriptions.
pub fn register_metrics() {
    describe_counter!(
        "staging_transfers_total",
        "Total number of transfers dispatched, labeled by direction"
    );
    describe_counter!(
        "staging_transfers_failed_total",
        "Total number of transfers that failed to dispatch or complete"
    );
    describe_counter!(
        "staging_transfer_bytes_total",
        "Total bytes moved through staging buffers, labeled by direction"
    );
    describe_gauge!(
        "staging_buffers_in_use",
        "Staging buffers currently owned by in-flight transfers"
    );
    describe_histogram!(
        "staging_host_copy_seconds",
        "Duration of the synchronous host-side copy into a staging buffer"
    );
    describe_histogram!(
        "staging_completion_seconds",
        "Time from device-copy enqueue to buffer release"
    );

    info!("transfer metrics registered");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        // describe-only calls must be safe without an installed recorder
        register_metrics();
        register_metrics();
    }
}
