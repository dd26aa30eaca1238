//! Bounded-attempt retry with backoff and shutdown awareness.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::cancel::ShutdownSignal;
use crate::error::LoaderError;

/// Invoke `f` up to `max_attempts` times.
///
/// After a failed attempt the driver sleeps `backoff * factor^(attempt-1)`,
/// racing the sleep against the shutdown signal. Shutdown short-circuits
/// with [`LoaderError::Cancelled`] and a cancellation returned by `f` itself
/// is never retried. The last attempt's error is returned verbatim.
///
/// `f` must be safe to re-invoke: the executor's callers guarantee this via
/// merged-replace semantics or the safe-mode rewrites.
pub async fn retry_context<F, Fut, T>(
    signal: &ShutdownSignal,
    max_attempts: usize,
    backoff: Duration,
    factor: u32,
    mut f: F,
) -> Result<T, LoaderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LoaderError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut wait = backoff;
    for attempt in 1..=max_attempts {
        if signal.is_shutdown() {
            return Err(LoaderError::Cancelled);
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                if attempt == max_attempts {
                    return Err(err);
                }
                warn!(attempt, error = %err, "attempt failed, backing off");
                tokio::select! {
                    _ = signal.cancelled() => return Err(LoaderError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
                wait = wait.saturating_mul(factor.max(1));
            }
        }
    }
    unreachable!("retry loop returns on the final attempt")
}
