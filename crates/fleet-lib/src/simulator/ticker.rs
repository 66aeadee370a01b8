//! Simulator tick loop
//!
//! Emits a tick into the pipeline mailbox every `tick_period`. The loop only
//! schedules; generation happens in the pipeline so simulated readings go
//! through exactly the same path as live ones.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::models::now_millis;

/// One simulator tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatorTick {
    /// Wall clock at emission, epoch milliseconds
    pub at: i64,
    /// Run the tick belongs to; stale ticks from a stopped run carry an old value
    pub generation: u64,
}

/// Handle to a running tick loop; stopping or dropping it cancels the loop
pub struct SimulatorTicker {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl SimulatorTicker {
    /// Start emitting ticks, each mapped into the receiver's event type
    pub fn spawn<E, F>(
        period: Duration,
        generation: u64,
        events: mpsc::Sender<E>,
        wrap: F,
    ) -> Self
    where
        E: Send + 'static,
        F: Fn(SimulatorTick) -> E + Send + 'static,
    {
        info!(
            period_ms = period.as_millis() as u64,
            generation = generation,
            "Starting fallback simulator"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick of a tokio interval completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let tick = SimulatorTick {
                    at: now_millis(),
                    generation,
                };
                if events.send(wrap(tick)).await.is_err() {
                    debug!("Pipeline mailbox closed, stopping simulator ticks");
                    break;
                }
            }
        });

        Self {
            handle: Some(handle),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Cancel the loop
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!(generation = self.generation, "Stopped fallback simulator");
        }
    }
}

impl Drop for SimulatorTicker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticker_emits_with_generation() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut ticker = SimulatorTicker::spawn(Duration::from_millis(10), 7, tx, |t| t);

        let tick = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick.generation, 7);
        assert!(ticker.is_running());

        ticker.stop();
        assert!(!ticker.is_running());
    }

    #[tokio::test]
    async fn test_ticker_stops_when_mailbox_closes() {
        let (tx, rx) = mpsc::channel::<SimulatorTick>(1);
        drop(rx);
        let ticker = SimulatorTicker::spawn(Duration::from_millis(5), 1, tx, |t| t);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ticker.is_running());
    }
}
