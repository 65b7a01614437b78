//! Retry controller for connector fetches.
//!
//! Wraps every outbound platform call with bounded exponential backoff.
//! Delays double from `base_delay_ms` up to `max_delay_ms`; a server
//! `Retry-After` hint takes precedence over the computed delay. Backoff
//! sleeps race against the shutdown signal so a stop request never waits
//! out a rate-limit window.

use std::time::Duration;

use tokio::sync::watch;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Broadcast side of the shutdown signal. Held by whoever owns the
/// process lifecycle (the `run` command, or a test).
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receive side of the shutdown signal. Cheap to clone; one per task.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered. Also resolves if the handle
    /// was dropped, which only happens when the process is tearing down.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

pub fn shutdown_pair() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before the next try after `failed_attempts` failures:
    /// base, 2×base, 4×base, ... capped at `max_delay`. Non-decreasing
    /// in `failed_attempts`.
    pub fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        let ms = (self.base_delay.as_millis() as u64)
            .saturating_mul(1u64 << exp)
            .min(self.max_delay.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, fails non-retryably, or the attempt
/// budget is exhausted.
///
/// Only errors whose [`Error::is_retryable`] is true are retried; auth
/// and normalization failures surface immediately. When the budget runs
/// out on rate limiting, the returned error carries the attempt count
/// and the last server hint.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    connector_id: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut shutdown = shutdown.clone();
    let mut last_err: Option<Error> = None;

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            let delay = match last_err.as_ref().and_then(|e| e.retry_after()) {
                Some(hint) => hint,
                None => policy.backoff_delay(attempt - 1),
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.triggered() => {
                    return Err(Error::Cancelled {
                        connector: connector_id.to_string(),
                    });
                }
            }
        }

        if shutdown.is_triggered() {
            return Err(Error::Cancelled {
                connector: connector_id.to_string(),
            });
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    connector = connector_id,
                    attempt,
                    error = %err,
                    "retryable fetch failure"
                );
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    match last_err {
        Some(Error::RateLimited { retry_after, .. }) => Err(Error::RateLimited {
            connector: connector_id.to_string(),
            attempts: policy.max_attempts,
            retry_after,
        }),
        Some(err) => Err(err),
        None => Err(Error::TransientFetch {
            connector: connector_id.to_string(),
            reason: "retry budget exhausted before first attempt".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            max_attempts: 3,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(450));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(450));
    }

    #[test]
    fn backoff_is_monotonic() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(3_000),
            max_attempts: 8,
        };
        let mut prev = Duration::ZERO;
        for failed in 1..=10 {
            let delay = policy.backoff_delay(failed);
            assert!(delay >= prev, "delay shrank at attempt {}", failed);
            assert!(delay <= Duration::from_millis(3_000));
            prev = delay;
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let (_handle, shutdown) = shutdown_pair();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = retry_with_backoff(&fast_policy(3), &shutdown, "github:test", move || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::TransientFetch {
                        connector: "github:test".to_string(),
                        reason: "connection reset".to_string(),
                    })
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let (_handle, shutdown) = shutdown_pair();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<()> =
            retry_with_backoff(&fast_policy(3), &shutdown, "slack:test", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Auth {
                        connector: "slack:test".to_string(),
                        reason: "token revoked".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let (_handle, shutdown) = shutdown_pair();

        let result: Result<()> =
            retry_with_backoff(&fast_policy(3), &shutdown, "github:test", || async {
                Err(Error::RateLimited {
                    connector: "github:test".to_string(),
                    attempts: 1,
                    retry_after: None,
                })
            })
            .await;

        match result {
            Err(Error::RateLimited { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RateLimited, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn retry_after_hint_overrides_backoff() {
        let (_handle, shutdown) = shutdown_pair();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let start = std::time::Instant::now();
        let result = retry_with_backoff(&fast_policy(2), &shutdown, "github:test", move || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::RateLimited {
                        connector: "github:test".to_string(),
                        attempts: 1,
                        retry_after: Some(Duration::from_millis(80)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        // Computed backoff would be 1ms; the 80ms hint must win.
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff_sleep() {
        let (handle, shutdown) = shutdown_pair();
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
        };

        let task = tokio::spawn(async move {
            retry_with_backoff(&policy, &shutdown, "discord:test", || async {
                Err::<(), _>(Error::TransientFetch {
                    connector: "discord:test".to_string(),
                    reason: "timeout".to_string(),
                })
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.trigger();

        let start = std::time::Instant::now();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
