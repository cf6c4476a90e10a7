//! Abstract metrics sink: the core emits timings and success counters via
//! this trait rather than reaching for a concrete backend directly.
//!
//! Registration with a real backend (Prometheus, statsd, ...) is a
//! process-level concern left to the caller; this crate only defines the
//! seam and a `log`-based default so the daemon is useful standalone.

use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    fn observe_mirror_duration(&self, remote: &str, duration: Duration);
    fn record_mirror_result(&self, remote: &str, success: bool);
    fn set_last_reload_success(&self, remote: &str, success: bool, at_unix_secs: u64);
}

/// Default sink: logs at `info`/`warn`. Matches the ambient logging style
/// used throughout the pack (`log::info!`, `log::warn!`) rather than
/// silently discarding metrics.
#[derive(Default)]
pub struct LoggingMetricsSink;

impl MetricsSink for LoggingMetricsSink {
    fn observe_mirror_duration(&self, remote: &str, duration: Duration) {
        log::debug!("metric mirror_duration_seconds{{remote={remote:?}}} {:.3}", duration.as_secs_f64());
    }

    fn record_mirror_result(&self, remote: &str, success: bool) {
        log::debug!("metric mirror_success_total{{remote={remote:?}}} +1 (success={success})");
    }

    fn set_last_reload_success(&self, remote: &str, success: bool, at_unix_secs: u64) {
        log::debug!(
            "metric last_reload_success{{remote={remote:?}}} {} at {at_unix_secs}",
            success as u8
        );
    }
}
