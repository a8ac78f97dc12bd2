//! Prometheus metrics exposition
//!
//! Component crates emit through the `metrics` facade; this module installs
//! the exporter the admin `/metrics` endpoint renders:
//!
//! - `jobs_processed_total` (counter): labels `job_type`, `outcome`
//! - `job_duration_seconds` (histogram): label `job_type`
//! - `jobs_queued` (gauge): label `status`
//! - `ratelimit_denied_total`, `ratelimit_usage_recorded_total`
//! - `pool_connections_total`, `cache_lookups_total`, `credential_refresh_total`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use scheduler::{JobCounts, JobStatus};

/// Handler durations range from cache hits to the 300s job timeout.
const JOB_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("job_duration_seconds".to_string()),
        JOB_DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// `job_duration_seconds` gets explicit buckets so it renders as a histogram
/// with `_bucket` lines instead of a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Publish queue depth by status.
pub fn record_queue_depth(counts: &JobCounts) {
    for status in JobStatus::ALL {
        metrics::gauge!("jobs_queued", "status" => status.as_str()).set(counts.get(status) as f64);
    }
}
