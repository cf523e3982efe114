//! Timer primitives shared by the health prober and the retry loop.
//!
//! Everything here runs on tokio time, so tests drive it with a paused
//! clock (`#[tokio::test(start_paused = true)]`) instead of real sleeps.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A sleep or ticker was stopped by its cancellation token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Sleep for `duration` unless `token` fires first
pub async fn sleep_cancellable(duration: Duration, token: &CancellationToken) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        return Err(Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = token.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Periodic background job bound to a cancellation token.
///
/// The spawned task is detached: the runtime does not wait for it on
/// shutdown, so a ticker never keeps the process alive by itself.
#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    token: CancellationToken,
}

impl Ticker {
    pub fn new(period: Duration, token: CancellationToken) -> Self {
        Self { period, token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run `tick` immediately and then once per period.
    ///
    /// The job stops when the token is cancelled or when `tick` returns `false`.
    pub fn spawn<F, Fut>(self, name: &'static str, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        debug!(job = name, "Ticker cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        if !tick().await {
                            debug!(job = name, "Ticker job finished");
                            break;
                        }
                    }
                }
            }
        })
    }
}
