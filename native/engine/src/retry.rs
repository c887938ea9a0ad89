use std::{error::Error, future::Future, time::Duration};

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{EngineError, is_transient},
    models::Settings,
};

/// Retry parameters for network operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_backoff_ms: u64) -> Self {
        Self { attempts: attempts.max(1), base_backoff: Duration::from_millis(base_backoff_ms) }
    }

    /// Policy for network-lane work. `network_retry_attempts` counts every attempt.
    pub fn for_network(settings: &Settings) -> Self {
        Self::new(settings.network_retry_attempts, settings.retry_backoff_ms)
    }

    /// Delay before retry number `attempt` (1-based): exponential with up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_cap = (base.as_millis() as u64) / 4;
        let jitter = if jitter_cap == 0 { 0 } else { rand::rng().random_range(0..=jitter_cap) };
        base + Duration::from_millis(jitter)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, runs out of attempts
/// or `token` is cancelled.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    token: &CancellationToken,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(op = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if token.is_cancelled() || attempt >= policy.attempts || !is_transient(&e) {
                    return Err(e);
                }
                let delay = policy.backoff(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = e.as_ref() as &dyn Error,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {
                        return Err(e.context(EngineError::cancelled(format!("{op_name} cancelled"))));
                    }
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use anyhow::anyhow;

    use super::*;
    use crate::error::{ErrorKind, kind_of};

    #[tokio::test(flavor = "multi_thread")]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let result = retry_transient(RetryPolicy::new(3, 1), &token, "test", |_| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::network("connection reset", true).into())
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gives_up_on_terminal_errors_and_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let err = retry_transient(RetryPolicy::new(5, 1), &token, "test", |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow!(EngineError::network("not found", false)))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kind_of(&err), Some(ErrorKind::Network));

        calls.store(0, Ordering::SeqCst);
        let _ = retry_transient(RetryPolicy::new(2, 1), &token, "test", |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow!(EngineError::network("timeout", true)))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::new(4, 100);
        assert!(policy.backoff(1) >= Duration::from_millis(100));
        assert!(policy.backoff(1) <= Duration::from_millis(125));
        assert!(policy.backoff(3) >= Duration::from_millis(400));
        assert_eq!(RetryPolicy::new(0, 5).attempts, 1);
    }
}
