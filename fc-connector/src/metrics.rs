//! Metrics for the FC connector
//!
//! Recorded through the `metrics` facade. The library never installs a
//! recorder; a service embedding the connector installs its own exporter
//! and these series show up there.

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names
pub mod names {
    /// Counter: Total number of connector operations by type and status
    pub const FC_OPERATIONS_TOTAL: &str = "fc_operations_total";
    /// Histogram: Duration of connector operations in seconds
    pub const FC_OPERATION_DURATION_SECONDS: &str = "fc_operation_duration_seconds";
    /// Counter: Number of SCSI host rescans triggered while polling for a device
    pub const FC_HOST_RESCANS_TOTAL: &str = "fc_host_rescans_total";
    /// Counter: Number of retried attempts inside bounded polling loops
    pub const FC_RETRIES_TOTAL: &str = "fc_retries_total";
}

/// Record a connector operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::FC_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::FC_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a host rescan
pub fn record_rescan() {
    counter!(names::FC_HOST_RESCANS_TOTAL).increment(1);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::FC_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation, labelling it by outcome
    pub fn finish<T>(self, result: &crate::error::Result<T>) {
        let duration = self.start.elapsed().as_secs_f64();
        let status = match result {
            Ok(_) => "success",
            Err(e) => match e.kind() {
                crate::error::ErrorKind::Validation => "invalid",
                crate::error::ErrorKind::NotFound => "not_found",
                crate::error::ErrorKind::ExternalCommand => "command_failed",
            },
        };
        record_operation(self.operation, status, duration);
    }
}
