//! Retry policies.
//!
//! Two distinct retry layers exist, mirroring spec.md §5 and §9:
//!
//! - [`with_transport_retry`]: a fixed, hard-coded schedule (1s, 1s, then
//!   2s exponential) applied only to connection errors and timeouts talking
//!   to the backend. Non-200 responses are not retried here.
//! - [`retry_with_policy`]: the user-configurable [`RetryPolicy`], applied
//!   uniformly around a full `GenerateWithModel` / `GenerateWithChat` call,
//!   including application-level failures like `response_too_short` (see
//!   SPEC_FULL.md's resolution of Open Question 1).
//!
//! The teacher's retry module wraps `keen_retry`'s combinator API, which
//! encodes the retry policy in the type system. That doesn't fit here: the
//! policy is chosen at runtime from [`Config`], not at compile time, so this
//! is a plain loop instead.

use std::{future::Future, time::Duration};

use rand::Rng;

use crate::{
    config::{RetryPolicy, RetryStrategy},
    prelude::*,
};

/// Fixed transport-level retry schedule: wait this long before each retry,
/// in order. Exhausting the list means the 3rd (and final) retry has
/// happened.
const TRANSPORT_RETRY_WAITS_SECS: [f64; 3] = [1.0, 1.0, 2.0];

/// Retry `f` on transport-level failure (connection error or timeout) using
/// the fixed schedule in [`TRANSPORT_RETRY_WAITS_SECS`]. `f` is called once
/// per attempt; `is_transient` decides whether an error is worth retrying.
pub async fn with_transport_retry<T, E, F, Fut>(
    mut f: F,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for wait in TRANSPORT_RETRY_WAITS_SECS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                debug!("Transient transport error, retrying after {wait}s");
                last_err = Some(err);
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
            Err(err) => return Err(err),
        }
    }
    // Final attempt after the schedule is exhausted.
    match f().await {
        Ok(value) => Ok(value),
        Err(err) => Err(last_err.unwrap_or(err)),
    }
}

/// Compute the wait, in seconds, before attempt number `attempt` (1-based)
/// under `policy`.
fn compute_wait(policy: &RetryPolicy, attempt: u32) -> f64 {
    match policy.strategy {
        RetryStrategy::None => 0.0,
        RetryStrategy::Fixed => policy.min_wait,
        RetryStrategy::Exponential => {
            let wait = policy.min_wait * 2f64.powi(attempt.saturating_sub(1) as i32);
            wait.min(policy.max_wait)
        }
        RetryStrategy::RandomExponential => {
            let ceiling = (policy.min_wait * 2f64.powi(attempt.saturating_sub(1) as i32))
                .min(policy.max_wait);
            if ceiling <= policy.min_wait {
                ceiling
            } else {
                rand::thread_rng().gen_range(policy.min_wait..=ceiling)
            }
        }
    }
}

/// Run `attempt_fn` under `policy`, retrying while it returns a JSON object
/// carrying an `error` key. `attempt_fn` receives the 1-based attempt
/// number. `RetryStrategy::None` short-circuits to exactly one attempt,
/// regardless of `max_attempts` (spec.md §9: "must short-circuit the retry
/// wrapper entirely, not degenerate to one retry" — one attempt here means
/// no *retry* ever happens, which is the same thing phrased the other way).
pub async fn retry_with_policy<F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> Value
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Value>,
{
    let attempts = if policy.strategy == RetryStrategy::None {
        1
    } else {
        policy.max_attempts.max(1)
    };

    let mut last = json!({"error": "no_attempts_made"});
    for attempt in 1..=attempts {
        let result = attempt_fn(attempt).await;
        if result.get("error").is_none() {
            return result;
        }
        debug!(
            "Attempt {attempt}/{attempts} failed: {:?}",
            result.get("error")
        );
        last = result;
        if attempt < attempts {
            let wait = compute_wait(policy, attempt);
            if wait > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        }
    }
    last
}
