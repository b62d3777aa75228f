use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::debug;
use crate::config::RetryConfig;

/// Delay before retry number `attempt` (0-based), with up to 10% jitter, capped at `max_delay_ms`
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let jitter = base * 0.1 * rand::thread_rng().gen_range(0.0..1.0);
    let millis = (base + jitter).min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(millis as u64)
}

/// Runs `f` until it succeeds, `should_retry` rejects the error, or
/// `config.max_attempts` attempts have been made
pub async fn with_backoff<F, Fut, T, E, P>(config: &RetryConfig, should_retry: P, f: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts || !should_retry(&e) {
                    return Err(e);
                }
                let delay = backoff_delay(config, attempt - 1);
                debug!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "Retrying after backoff");
                sleep(delay).await;
            }
        }
    }
}

/// Retries `f` with a linearly growing delay
pub async fn with_retry<F, Fut, T, E>(
    f: F,
    retries: u32,
    delay: Duration,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempts += 1;
                if attempts >= retries {
                    return Err(e);
                }
                sleep(delay * attempts).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            backoff_multiplier: 2.0,
        };
        assert!(backoff_delay(&config, 0) >= Duration::from_millis(100));
        assert!(backoff_delay(&config, 0) <= Duration::from_millis(110));
        assert_eq!(backoff_delay(&config, 6), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_retry() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), &str> = with_backoff(&fast_config(1), |_| true, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("busy")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, &str> = with_backoff(&fast_config(4), |_| true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err("busy") } else { Ok(n) }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), &str> = with_backoff(&fast_config(5), |e| *e != "fatal", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("fatal")
        })
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), &str> = with_retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            },
            2,
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
