//! Prometheus metrics for the DP5 server
//!
//! Only route, track and outcome labels; never request content.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub const ROUTE_REGISTER: &str = "register";
pub const ROUTE_LOOKUP: &str = "lookup";
pub const ROUTE_DOWNLOAD: &str = "download";

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_REJECTED: &str = "rejected";
pub const OUTCOME_SERVER_ERROR: &str = "server_error";

pub fn record_request(route: &str, track: &str, outcome: &str, duration: Duration) {
    counter!("dp5_requests_total", "route" => route.to_string(), "track" => track.to_string(), "outcome" => outcome.to_string()).increment(1);
    histogram!("dp5_request_duration_seconds", "route" => route.to_string(), "track" => track.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_current_epoch(track: &str, epoch: u64) {
    gauge!("dp5_current_epoch", "track" => track.to_string()).set(epoch as f64);
}

pub fn record_epoch_change(track: &str) {
    counter!("dp5_epoch_changes_total", "track" => track.to_string()).increment(1);
}

pub fn set_lookup_handles(track: &str, count: usize) {
    gauge!("dp5_lookup_handles", "track" => track.to_string()).set(count as f64);
}

pub fn record_shard_download(outcome: &str) {
    counter!("dp5_shard_downloads_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn init_prometheus_recorder() -> anyhow::Result<metrics_exporter_prometheus::PrometheusHandle> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    Ok(builder.install_recorder()?)
}
