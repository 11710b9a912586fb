//! Fixed-delay retry for flaky pipeline states.
//!
//! Network-bound states (dependency install, image build) fail transiently;
//! each gets a fresh budget of `tries` attempts with a constant pause in
//! between. The pause goes through [`Sleeper`] so tests never wait.

use std::time::Duration;

/// Injectable sleep, mirroring how process execution is injectable.
#[allow(async_fn_in_trait)]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper over the tokio timer.
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Attempt budget and inter-attempt delay for one retryable state.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    tries: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `tries` must be at least 1; configuration validation enforces this.
    pub fn new(tries: u32, delay: Duration) -> Self {
        Self {
            tries: tries.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds or the budget is exhausted. Returns the
    /// error of the final attempt.
    pub async fn run<T, E, Op>(
        &self,
        sleeper: &impl Sleeper,
        state: &str,
        mut op: Op,
    ) -> Result<T, E>
    where
        Op: AsyncFnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.tries => {
                    tracing::warn!(
                        state,
                        attempt,
                        tries = self.tries,
                        %error,
                        "attempt failed, retrying after delay"
                    );
                    sleeper.sleep(self.delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::error!(state, attempt, %error, "attempts exhausted");
                    return Err(error);
                }
            }
        }
    }
}
