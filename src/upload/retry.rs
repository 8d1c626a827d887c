//! Retry and host failover
//!
//! Two tiers with different rules:
//!
//! - **Part tier** ([`RetryPolicy::run`]): any failure of a single part PUT
//!   is retried, up to the attempt budget.
//! - **Host tier** ([`with_host_failover`]): a whole transfer is retried on
//!   the same host only for server-class failures, moves on to the next
//!   candidate host once the budget is spent, and stops immediately on
//!   anything the server rejected as invalid.

use super::{UploadError, UploadTarget};
use std::future::Future;
use std::time::Duration;

/// Service sub-codes at or above this value are server-side faults.
pub const RETRYABLE_ERROR_CODE: i64 = 5000;

/// Status codes at or above this value are server-side faults.
pub const RETRYABLE_STATUS: i64 = 500;

/// What the host tier does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the same host again while attempts remain.
    Retry,
    /// Give up on this host, continue with the next candidate.
    NextHost,
    /// Stop; no other host would fare better.
    Abort,
}

/// Classify an error for the host tier.
pub fn classify(err: &UploadError) -> RetryDecision {
    match err {
        UploadError::Transfer(e) => {
            if e.is_transport() {
                return RetryDecision::Retry;
            }
            match e.error_code {
                Some(code) if code >= RETRYABLE_ERROR_CODE => RetryDecision::Retry,
                Some(code) if code != 0 => RetryDecision::Abort,
                _ => {
                    // A zero envelope code carries no information.
                    let code = e.code.filter(|c| *c != 0).unwrap_or(0);
                    let status = e.status.map(i64::from).unwrap_or(0);
                    if code >= RETRYABLE_STATUS || status >= RETRYABLE_STATUS {
                        RetryDecision::Retry
                    } else {
                        RetryDecision::Abort
                    }
                }
            }
        }
        UploadError::IntegrityMismatch { .. } | UploadError::MalformedResponse(_) => {
            RetryDecision::NextHost
        }
        UploadError::UploadFailed { .. } => RetryDecision::NextHost,
        _ => RetryDecision::Abort,
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds or the budget is spent, retrying any error.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, UploadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        self.run_if(op, |_| true).await
    }

    /// Like [`run`](Self::run), but only errors matching `should_retry` are
    /// retried; the rest are returned immediately.
    pub async fn run_if<T, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, UploadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
        P: Fn(&UploadError) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts || !should_retry(&err) {
                        return Err(err);
                    }
                    tracing::debug!(attempt, error = %err, "Retrying after failure");
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }
    }
}

/// Run `op` against each candidate target in order until one succeeds.
///
/// Every host of a target gets the full attempt budget, starting at its
/// preferred host; when they are spent the next candidate takes over.
/// `op` receives the target pointed at the current host and the 0-based
/// attempt number on that host. Returns the value together with that
/// target.
pub async fn with_host_failover<T, F, Fut>(
    targets: &[UploadTarget],
    policy: RetryPolicy,
    mut op: F,
) -> Result<(T, UploadTarget), UploadError>
where
    F: FnMut(UploadTarget, u32) -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    if targets.is_empty() {
        return Err(UploadError::NoUploadAddress(
            "no candidate upload address".into(),
        ));
    }

    let attempts = policy.attempts.max(1);
    let mut last: Option<UploadError> = None;
    let mut hosts_tried = 0;

    for (index, candidate) in targets.iter().enumerate() {
        let mut current = candidate.clone();
        loop {
            hosts_tried += 1;
            for attempt in 0..attempts {
                match op(current.clone(), attempt).await {
                    Ok(value) => {
                        if hosts_tried > 1 {
                            tracing::info!(
                                host = %current.host(),
                                candidate = index,
                                "Upload succeeded on fallback host"
                            );
                        }
                        return Ok((value, current));
                    }
                    Err(err) => {
                        let decision = classify(&err);
                        tracing::warn!(
                            host = %current.host(),
                            attempt,
                            decision = ?decision,
                            error = %err,
                            "Upload attempt failed"
                        );
                        match decision {
                            RetryDecision::Abort => return Err(err),
                            RetryDecision::NextHost => {
                                last = Some(err);
                                break;
                            }
                            RetryDecision::Retry => {
                                last = Some(err);
                                if attempt + 1 < attempts && !policy.delay.is_zero() {
                                    tokio::time::sleep(policy.delay).await;
                                }
                            }
                        }
                    }
                }
            }
            if !current.advance_host() {
                break;
            }
        }
    }

    Err(UploadError::UploadFailed {
        hosts: hosts_tried,
        last: last.map(Box::new),
    })
}
