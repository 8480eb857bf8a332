//! Error taxonomy for the switchboard.
//!
//! Errors are split along two axes that the retry machinery cares about:
//! whether an error is worth retrying at all, and whether it indicates a
//! problem with the *deployment* (as opposed to the request). Deployment
//! faults put the deployment into cooldown; client faults surface
//! immediately and leave the deployment alone.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum SwitchboardError {
    /// 5xx, connection reset, or timeout. Retried inside the deployment
    /// client; cools the deployment down on exhaustion.
    #[error("transient upstream error (status {status:?}): {message}")]
    TransientUpstream {
        status: Option<u16>,
        message: String,
    },

    /// 429 from the deployment, with the parsed `retry-after` if present.
    #[error("rate limited, retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },

    /// 401/403. Not retryable, does not cool the deployment down.
    #[error("unauthorized (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// 400 and other client errors. Not retryable.
    #[error("bad request (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    /// Caller-initiated cancellation, propagated without retry.
    #[error("request canceled by caller")]
    Canceled,

    /// Selection found no healthy deployment.
    #[error("no healthy deployment available")]
    NoHealthyDeployment,

    /// The outer failover loop ran out of attempts.
    #[error("all deployments failed after {} attempt(s)", .causes.len())]
    AllDeploymentsFailed { causes: Vec<AttemptFailure> },

    /// The deployment answered with a body we could not decode.
    #[error("invalid response from deployment: {0}")]
    InvalidResponse(String),

    /// A streaming response failed mid-flight.
    #[error("stream error: {0}")]
    Stream(String),

    #[error("duplicate deployment name: {0}")]
    DuplicateDeployment(String),

    #[error("no deployments configured")]
    NoDeployments,
}

/// One failed attempt of the outer failover loop.
#[derive(Debug)]
pub struct AttemptFailure {
    /// The deployment the attempt ran against, if selection got that far.
    pub deployment: Option<String>,
    pub cause: Box<SwitchboardError>,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.deployment {
            Some(name) => write!(f, "{name}: {}", self.cause),
            None => write!(f, "(no deployment selected): {}", self.cause),
        }
    }
}

impl SwitchboardError {
    /// Whether the outer failover loop should try another deployment.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwitchboardError::TransientUpstream { .. }
                | SwitchboardError::RateLimited { .. }
                | SwitchboardError::NoHealthyDeployment
                | SwitchboardError::InvalidResponse(_)
                | SwitchboardError::Stream(_)
        )
    }

    /// Whether the error indicts the deployment itself rather than the
    /// request. Deployment faults trigger cooldown; a body we cannot
    /// decode counts, since the deployment produced it.
    pub fn is_deployment_fault(&self) -> bool {
        matches!(
            self,
            SwitchboardError::TransientUpstream { .. }
                | SwitchboardError::RateLimited { .. }
                | SwitchboardError::Stream(_)
                | SwitchboardError::InvalidResponse(_)
        )
    }
}
