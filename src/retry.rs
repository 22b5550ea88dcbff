//! Bounded stage retry and per-call timeout.
//!
//! Every stage call goes through [`with_retry`] wrapped around
//! [`with_timeout`], so a timeout is just another failed attempt. The wait
//! between attempts is fixed.

use crate::error::{Stage, StageError};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// How many times a failed call is repeated and how long to wait between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-invocations after the first failure. Total calls = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

/// Every allowed call failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    /// Calls made, including the first.
    pub attempts: u32,
    pub last: StageError,
}

/// Run `op` until it succeeds or the policy is used up.
///
/// `op` receives the 0-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            warn!(
                "{}: retry {}/{} after {:?}",
                label, attempt, policy.max_retries, policy.backoff
            );
            sleep(policy.backoff).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{}: attempt {} failed: {}", label, attempt + 1, e);
                last_err = Some(e);
            }
        }
    }

    Err(RetryExhausted {
        attempts: policy.max_retries + 1,
        last: last_err.unwrap_or_else(|| StageError::Transport("no attempt was made".into())),
    })
}

/// Stop waiting for `fut` after `limit`.
///
/// The future is dropped on expiry, which closes the client side of any
/// request in flight; the remote side may still finish the work.
pub async fn with_timeout<T, Fut>(stage: Stage, limit: Duration, fut: Fut) -> Result<T, StageError>
where
    Fut: Future<Output = Result<T, StageError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StageError::Timeout {
            stage,
            secs: limit.as_secs(),
        }),
    }
}
