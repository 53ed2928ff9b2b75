use std::time::Duration;

use tracing::warn;

use crate::error::{CairnError, Result};

/// Retry settings for remote operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RETRY_ATTEMPTS, 500)
    }
}

/// Run a remote operation, retrying `Transient` failures with exponential
/// backoff plus jitter. Any other error propagates immediately.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    op_name: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = policy.base_delay_ms;
    let mut last_err: Option<CairnError> = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(policy.max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    policy.max_attempts,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| CairnError::Other(format!("{op_name}: retries exhausted"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), "put", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CairnError::Transient("flaky".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_policy(5), "put", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CairnError::UserInformation("bad config".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausts_attempts_then_fails() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_policy(3), "put", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CairnError::Transient("down".into()))
        });
        assert!(matches!(result, Err(CairnError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
