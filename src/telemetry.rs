//! Metric emission.
//!
//! Measurements go through the `metrics` facade; whichever exporter the
//! embedding application installs receives them. The metric names below
//! are a stable wire contract.

use crate::deployment::DeploymentClient;
use crate::models::Usage;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "request_duration_seconds";
pub const TOKENS_TOTAL: &str = "tokens_total";
pub const RPM_UTILIZATION: &str = "rpm_utilization";
pub const TPM_UTILIZATION: &str = "tpm_utilization";
pub const DEPLOYMENT_HEALTHY: &str = "deployment_healthy";
pub const SESSION_AFFINITY_EVENTS_TOTAL: &str = "session_affinity_events_total";

/// Which part of the request the duration sample covers: time to first
/// byte, or the whole exchange.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Phase {
    Ttfb,
    Total,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Ttfb => "ttfb",
            Phase::Total => "total",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum AffinityEvent {
    Hit,
    Miss,
    Rebind,
}

impl AffinityEvent {
    fn as_str(self) -> &'static str {
        match self {
            AffinityEvent::Hit => "hit",
            AffinityEvent::Miss => "miss",
            AffinityEvent::Rebind => "rebind",
        }
    }
}

pub(crate) fn record_request(deployment: &str, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        REQUESTS_TOTAL,
        "deployment" => deployment.to_string(),
        "model" => model.to_string(),
        "status" => status
    )
    .increment(1);
}

pub(crate) fn record_duration(deployment: &str, model: &str, phase: Phase, elapsed: Duration) {
    histogram!(
        REQUEST_DURATION_SECONDS,
        "deployment" => deployment.to_string(),
        "model" => model.to_string(),
        "status" => "success",
        "phase" => phase.as_str()
    )
    .record(elapsed.as_secs_f64());
}

fn record_token_kind(deployment: &str, model: &str, kind: &'static str, count: u64) {
    if count == 0 {
        return;
    }
    counter!(
        TOKENS_TOTAL,
        "deployment" => deployment.to_string(),
        "model" => model.to_string(),
        "kind" => kind
    )
    .increment(count);
}

pub(crate) fn record_tokens(deployment: &str, model: &str, usage: &Usage) {
    record_token_kind(deployment, model, "prompt", usage.prompt_tokens);
    record_token_kind(deployment, model, "completion", usage.completion_tokens);
    if let Some(details) = &usage.prompt_tokens_details {
        record_token_kind(deployment, model, "cached", details.cached_tokens);
    }
}

pub(crate) fn record_utilization(deployment: &DeploymentClient) {
    let snapshot = deployment.snapshot();
    let config = deployment.config();

    let rpm = if config.rpm_ratelimit > 0 {
        snapshot.rpm_used as f64 / config.rpm_ratelimit as f64
    } else {
        0.0
    };
    let tpm = if config.tpm_ratelimit > 0 {
        snapshot.tpm_used as f64 / config.tpm_ratelimit as f64
    } else {
        0.0
    };

    gauge!(RPM_UTILIZATION, "deployment" => snapshot.name.clone()).set(rpm);
    gauge!(TPM_UTILIZATION, "deployment" => snapshot.name).set(tpm);
}

pub(crate) fn record_health(deployment: &str, healthy: bool) {
    gauge!(DEPLOYMENT_HEALTHY, "deployment" => deployment.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub(crate) fn record_affinity(event: AffinityEvent) {
    counter!(SESSION_AFFINITY_EVENTS_TOTAL, "event" => event.as_str()).increment(1);
}
