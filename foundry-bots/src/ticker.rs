//! Loop pacing.
//!
//! The coordinator, workers and supervisor never call `sleep` directly; they
//! wait on a [`Ticker`] so tests can drive loops without real timers.

use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Ticker: Send {
    async fn wait(&mut self, period: Duration);
}

/// Sleeps on the tokio clock (pausable in tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTicker;

#[async_trait]
impl Ticker for TokioTicker {
    async fn wait(&mut self, period: Duration) {
        tokio::time::sleep(period).await;
    }
}

/// Returns immediately and records every requested period.
#[derive(Debug, Default, Clone)]
pub struct RecordingTicker {
    pub waits: Vec<Duration>,
}

#[async_trait]
impl Ticker for RecordingTicker {
    async fn wait(&mut self, period: Duration) {
        self.waits.push(period);
        tokio::task::yield_now().await;
    }
}
