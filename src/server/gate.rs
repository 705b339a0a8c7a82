//! Admission decisions at the service boundary.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::FailurePolicy;
use crate::error::{RateWindowError, Result};
use crate::ratelimit::{KeyedLimiter, Limiter};

/// Outcome of a successful rate limit evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request was admitted and counted
    Admitted,
    /// The subject is over capacity; nothing was counted
    Throttled,
}

/// What the boundary does with a request once the failure policy is applied.
#[derive(Debug)]
pub enum Admission {
    /// Serve the request
    Admit,
    /// Reject with a rate-limit-exceeded signal
    Throttle,
    /// The limiter failed and the policy is to reject
    Unavailable(RateWindowError),
}

/// Checks subjects against their limiters and records admitted requests.
pub struct AdmissionGate {
    limiters: Arc<KeyedLimiter>,
    policy: FailurePolicy,
}

impl AdmissionGate {
    /// Create a gate over `limiters` that handles limiter errors per `policy`.
    pub fn new(limiters: Arc<KeyedLimiter>, policy: FailurePolicy) -> Self {
        Self { limiters, policy }
    }

    /// The failure policy in effect.
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// The per-subject limiters behind this gate.
    pub fn limiters(&self) -> &Arc<KeyedLimiter> {
        &self.limiters
    }

    /// Evaluate one request from `subject`, counting it if admitted.
    ///
    /// Limiter errors are returned unchanged.
    pub async fn check(&self, subject: &str) -> Result<Decision> {
        let limiter = self.limiters.limiter_for(subject)?;

        if limiter.is_ratelimit_exceeded().await? {
            debug!(subject = %subject, "Request throttled");
            return Ok(Decision::Throttled);
        }

        limiter.incr_request_count().await?;
        Ok(Decision::Admitted)
    }

    /// Evaluate one request from `subject` and apply the failure policy.
    pub async fn admit(&self, subject: &str) -> Admission {
        match self.check(subject).await {
            Ok(Decision::Admitted) => Admission::Admit,
            Ok(Decision::Throttled) => Admission::Throttle,
            Err(e) => match self.policy {
                FailurePolicy::FailOpen => {
                    warn!(subject = %subject, error = %e, "Limiter failed, admitting request");
                    Admission::Admit
                }
                FailurePolicy::FailClosed => {
                    warn!(subject = %subject, error = %e, "Limiter failed, rejecting request");
                    Admission::Unavailable(e)
                }
            },
        }
    }
}
