// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Reconnect schedule for console remotes: never gives up, starts at
    /// `base` and stays within a few multiples of it.
    pub fn reconnect(base: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay: base,
            max_delay: base.saturating_mul(5),
            multiplier: 1.5,
            jitter: 0.2,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
            current: self.base_delay,
        }
    }

    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Debug,
    {
        let mut backoff = self.backoff();
        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(error = ?e, attempt = backoff.attempt(), ?delay, "Retrying");
                        sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

/// Stateful walk through a policy's delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = self.current;
        self.current = std::cmp::min(
            Duration::from_secs_f64(self.current.as_secs_f64() * self.policy.multiplier),
            self.policy.max_delay,
        );
        Some(self.jittered(delay))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.policy.base_delay;
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: None,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let mut b = policy.backoff();
        let delays: Vec<_> = (0..4).filter_map(|_| b.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_in_band() {
        let mut b = RetryPolicy::reconnect(Duration::from_millis(1000)).backoff();
        let d = b.next_delay().unwrap();
        assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn execute_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let result: Result<(), &str> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("refused") }
            })
            .await;
        assert_eq!(result, Err("refused"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execute_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ()> = RetryPolicy::default()
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err(())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(1));
    }
}
