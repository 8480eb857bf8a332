//! Runtime state and request path for a single deployment.
//!
//! A [`DeploymentClient`] pairs immutable configuration with the mutable
//! state the balancer reads on every selection: health, cooldown deadline,
//! windowed usage counters, and the in-flight request count. Counters are
//! atomics so concurrent requests can account against them without
//! serialization; the cooldown deadline sits behind a small mutex that is
//! never held across an await.
//!
//! Token accounting is two-phase. Before dispatch the request cost is
//! *estimated* so concurrent selections see the pending load; once the
//! server reports authoritative usage, the estimate is replaced by the
//! real count.

use crate::client::ChatClient;
use crate::config::DeploymentConfig;
use crate::errors::SwitchboardError;
use crate::models::{ChatCompletion, ChatCompletionRequest};
use crate::stream::CompletionStream;
use crate::telemetry;
use futures_util::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Completion-token allowance assumed when the request does not cap
/// `max_tokens`. Keeps the preflight estimate an upper bound.
const DEFAULT_COMPLETION_ALLOWANCE: u64 = 500;

/// A 429 `retry-after` at or below this many seconds is absorbed with an
/// in-place backoff instead of a cooldown.
const SHORT_RETRY_AFTER_SECS: u64 = 2;

/// Backoff policy for retrying transient upstream failures inside the
/// deployment client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of a deployment's runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSnapshot {
    pub name: String,
    pub healthy: bool,
    pub cooling_down: bool,
    pub tpm_used: u64,
    pub rpm_used: u64,
    pub in_flight: u64,
    pub utilization: f64,
}

pub struct DeploymentClient {
    config: DeploymentConfig,
    client: Arc<dyn ChatClient>,
    retry: RetryPolicy,

    healthy: AtomicBool,
    cooldown_until: Mutex<Option<Instant>>,
    tpm_used: AtomicU64,
    rpm_used: AtomicU64,
    in_flight: AtomicU64,
    last_reset_at: Mutex<Instant>,
    last_probe_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for DeploymentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentClient")
            .field("name", &self.config.name)
            .field("healthy", &self.is_healthy())
            .field("tpm_used", &self.tpm_used.load(Ordering::Relaxed))
            .field("rpm_used", &self.rpm_used.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl DeploymentClient {
    pub fn new(config: DeploymentConfig, client: Arc<dyn ChatClient>, retry: RetryPolicy) -> Self {
        Self {
            config,
            client,
            retry,
            healthy: AtomicBool::new(true),
            cooldown_until: Mutex::new(None),
            tpm_used: AtomicU64::new(0),
            rpm_used: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            last_reset_at: Mutex::new(Instant::now()),
            last_probe_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// Whether this deployment is eligible for selection right now.
    pub fn is_healthy(&self) -> bool {
        !self.in_cooldown() && self.healthy.load(Ordering::Relaxed)
    }

    pub fn in_cooldown(&self) -> bool {
        self.cooldown_until
            .lock()
            .unwrap()
            .is_some_and(|until| Instant::now() < until)
    }

    /// Take this deployment out of rotation for `period`, defaulting to
    /// the configured cooldown period.
    pub fn cooldown(&self, period: Option<Duration>) {
        let period = period.unwrap_or_else(|| self.config.cooldown_period());
        warn!(deployment = %self.config.name, ?period, "cooling down deployment");
        *self.cooldown_until.lock().unwrap() = Some(Instant::now() + period);
        self.healthy.store(false, Ordering::Relaxed);
        telemetry::record_health(&self.config.name, false);
    }

    /// Combined utilization score in `[0, 1+)`; lower is a better
    /// selection target. Unlimited (0) sides contribute 0.
    pub fn utilization(&self) -> f64 {
        let token_util = if self.config.tpm_ratelimit > 0 {
            self.tpm_used.load(Ordering::Relaxed) as f64 / self.config.tpm_ratelimit as f64
        } else {
            0.0
        };
        let request_util = if self.config.rpm_ratelimit > 0 {
            self.rpm_used.load(Ordering::Relaxed) as f64 / self.config.rpm_ratelimit as f64
        } else {
            0.0
        };
        token_util.max(request_util)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Age of the current accounting window.
    pub fn time_since_reset(&self) -> Duration {
        self.last_reset_at.lock().unwrap().elapsed()
    }

    /// Roll the usage window: both counters back to zero.
    pub fn reset_usage(&self) {
        debug!(deployment = %self.config.name, "resetting usage counters");
        self.tpm_used.store(0, Ordering::Relaxed);
        self.rpm_used.store(0, Ordering::Relaxed);
        *self.last_reset_at.lock().unwrap() = Instant::now();
        telemetry::record_utilization(self);
    }

    pub fn snapshot(&self) -> DeploymentSnapshot {
        DeploymentSnapshot {
            name: self.config.name.clone(),
            healthy: self.is_healthy(),
            cooling_down: self.in_cooldown(),
            tpm_used: self.tpm_used.load(Ordering::Relaxed),
            rpm_used: self.rpm_used.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            utilization: self.utilization(),
        }
    }

    /// Whether the supervisor should probe this deployment on the current
    /// tick: not cooling down, and its own probe interval has elapsed.
    pub(crate) fn due_for_probe(&self) -> bool {
        if self.in_cooldown() {
            return false;
        }
        self.last_probe_at
            .lock()
            .unwrap()
            .is_none_or(|at| at.elapsed() >= self.config.healthcheck_interval())
    }

    /// Probe the deployment with a minimal completion.
    ///
    /// Success marks the deployment healthy and clears an *elapsed*
    /// cooldown; an explicit cooldown still in force is left alone.
    /// Failure cools the deployment down.
    pub async fn probe(&self) {
        *self.last_probe_at.lock().unwrap() = Some(Instant::now());
        match self.client.probe().await {
            Ok(()) => {
                let mut cooldown = self.cooldown_until.lock().unwrap();
                if cooldown.is_some_and(|until| Instant::now() < until) {
                    debug!(deployment = %self.config.name, "probe succeeded but cooldown still active");
                    return;
                }
                *cooldown = None;
                drop(cooldown);
                self.healthy.store(true, Ordering::Relaxed);
                telemetry::record_health(&self.config.name, true);
            }
            Err(e) => {
                warn!(deployment = %self.config.name, error = %e, "health probe failed");
                self.cooldown(None);
            }
        }
    }

    /// Issue a non-streaming completion, retrying transient failures.
    pub async fn create(
        self: &Arc<Self>,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletion, SwitchboardError> {
        let _guard = InFlightGuard::acquire(Arc::clone(self));
        let estimate = estimate_tokens(request);
        self.begin_accounting(estimate);

        let started = Instant::now();
        let result = self
            .with_retry(|| self.client.complete(request))
            .await;

        match result {
            Ok(response) => {
                if let Some(usage) = &response.usage {
                    self.reconcile_tokens(estimate, usage.total_tokens);
                    telemetry::record_tokens(&self.config.name, &request.model, usage);
                }
                telemetry::record_request(&self.config.name, &request.model, true);
                telemetry::record_duration(
                    &self.config.name,
                    &request.model,
                    telemetry::Phase::Total,
                    started.elapsed(),
                );
                Ok(response)
            }
            Err(e) => {
                telemetry::record_request(&self.config.name, &request.model, false);
                Err(e)
            }
        }
    }

    /// Issue a streaming completion. Retries apply only to acquiring the
    /// stream; once chunks flow, failures surface through the stream.
    pub async fn create_stream(
        self: &Arc<Self>,
        request: &ChatCompletionRequest,
    ) -> Result<CompletionStream, SwitchboardError> {
        let guard = InFlightGuard::acquire(Arc::clone(self));
        let estimate = estimate_tokens(request);
        self.begin_accounting(estimate);

        let result = self
            .with_retry(|| self.client.complete_stream(request))
            .await;

        match result {
            Ok(inner) => Ok(CompletionStream::new(
                inner,
                Arc::clone(self),
                request.model.clone(),
                estimate,
                guard,
            )),
            Err(e) => {
                telemetry::record_request(&self.config.name, &request.model, false);
                Err(e)
            }
        }
    }

    /// Test hook: account one request without going through `create`.
    #[cfg(test)]
    pub(crate) fn note_request_for_test(&self) {
        self.begin_accounting(0);
    }

    fn begin_accounting(&self, estimate: u64) {
        self.rpm_used.fetch_add(1, Ordering::Relaxed);
        self.tpm_used.fetch_add(estimate, Ordering::Relaxed);
        telemetry::record_utilization(self);
    }

    /// Replace the preflight estimate with the authoritative total,
    /// saturating at zero if the estimate overshot.
    pub(crate) fn reconcile_tokens(&self, estimate: u64, actual_total: u64) {
        if actual_total >= estimate {
            self.tpm_used
                .fetch_add(actual_total - estimate, Ordering::Relaxed);
        } else {
            let overshoot = estimate - actual_total;
            let _ = self
                .tpm_used
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(overshoot))
                });
        }
        telemetry::record_utilization(self);
    }

    /// Bounded retry with exponential backoff and jitter around one
    /// upstream call. A short 429 `retry-after` is absorbed in place
    /// once; anything longer (or retry exhaustion) cools the deployment
    /// down and surfaces the error.
    async fn with_retry<'a, T>(
        &self,
        mut op: impl FnMut() -> BoxFuture<'a, Result<T, SwitchboardError>>,
    ) -> Result<T, SwitchboardError> {
        let mut transient_failures = 0;
        let mut absorbed_rate_limit = false;
        let mut delay = self.retry.base_delay;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e @ SwitchboardError::TransientUpstream { .. }) => {
                    transient_failures += 1;
                    if transient_failures > self.retry.max_retries {
                        warn!(
                            deployment = %self.config.name,
                            error = %e,
                            "transient retries exhausted"
                        );
                        self.cooldown(None);
                        return Err(e);
                    }
                    debug!(
                        deployment = %self.config.name,
                        attempt = transient_failures,
                        error = %e,
                        "retrying after transient upstream error"
                    );
                    let jitter = delay.mul_f64(rand::rng().random_range(0.0..0.5));
                    tokio::time::sleep(delay + jitter).await;
                    delay = (delay * 2).min(self.retry.max_delay);
                }
                Err(SwitchboardError::RateLimited { retry_after }) => {
                    match retry_after {
                        Some(secs) if secs <= SHORT_RETRY_AFTER_SECS && !absorbed_rate_limit => {
                            debug!(
                                deployment = %self.config.name,
                                retry_after = secs,
                                "absorbing short rate-limit backoff"
                            );
                            absorbed_rate_limit = true;
                            tokio::time::sleep(Duration::from_secs(secs)).await;
                        }
                        _ => {
                            let period = retry_after
                                .map(Duration::from_secs)
                                .map(|ra| ra.max(self.config.cooldown_period()))
                                .unwrap_or_else(|| self.config.cooldown_period());
                            self.cooldown(Some(period));
                            return Err(SwitchboardError::RateLimited { retry_after });
                        }
                    }
                }
                // No retry for anything else, but errors the deployment
                // produced (e.g. an undecodable body) still cool it down.
                Err(e) => {
                    if e.is_deployment_fault() {
                        warn!(
                            deployment = %self.config.name,
                            error = %e,
                            "deployment fault without retry path"
                        );
                        self.cooldown(None);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Upper-bound token cost of a request before the server reports real
/// usage: roughly four characters per prompt token, plus the completion
/// allowance.
fn estimate_tokens(request: &ChatCompletionRequest) -> u64 {
    let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
    let prompt_tokens = (prompt_chars / 4) as u64;
    let completion_allowance = request
        .max_tokens
        .map(u64::from)
        .unwrap_or(DEFAULT_COMPLETION_ALLOWANCE);
    prompt_tokens + completion_allowance
}

/// RAII guard for the in-flight counter; releases on drop so streamed
/// responses count as in flight until the caller finishes (or drops) the
/// stream.
pub(crate) struct InFlightGuard {
    deployment: Arc<DeploymentClient>,
}

impl InFlightGuard {
    pub(crate) fn acquire(deployment: Arc<DeploymentClient>) -> Self {
        deployment.in_flight.fetch_add(1, Ordering::Relaxed);
        Self { deployment }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let _ = self
            .deployment
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }
}
