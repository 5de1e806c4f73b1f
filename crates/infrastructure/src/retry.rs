use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Clone, Debug)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                std::cmp::min(base.saturating_mul(factor), *max)
            }
        }
    }
}

/// 启动阶段连接外部依赖时的重试策略
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::exponential(Duration::from_millis(200), Duration::from_secs(5)),
        }
    }
}

pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts {
                    tracing::error!(dependency = what, attempt, error = %e, "giving up");
                    return Err(e);
                }
                let delay = config.backoff.delay_at(attempt);
                tracing::warn!(dependency = what, attempt, ?delay, error = %e, "retrying");
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_up_to_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.delay_at(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_at(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_at(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_at(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry_async(&RetryConfig::default(), "test", || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {n} failed"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let config = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        };
        let result: Result<(), &str> = retry_async(&config, "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .await;
        assert_eq!(result, Err("down"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
