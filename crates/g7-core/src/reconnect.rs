//! Delayed rescan scheduling.
//!
//! After an unexpected disconnect or a failed connection the manager waits a
//! short, fixed interval before scanning again so the platform stack can
//! release the old link. The wait runs on its own task and ends by sending a
//! message back into the manager's queue, so the manager itself never
//! sleeps. A scheduled rescan can be cancelled (forget, shutdown, or a newer
//! schedule superseding it).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Sends `message` on `tx` once `delay` has elapsed, unless cancelled first.
#[derive(Debug)]
pub struct RescanScheduler<T> {
    tx: mpsc::Sender<T>,
    message: T,
    delay: Duration,
    shutdown: CancellationToken,
    pending: Option<CancellationToken>,
}

impl<T: Clone + Send + 'static> RescanScheduler<T> {
    /// Create a scheduler. Cancelling `shutdown` cancels any pending send.
    pub fn new(tx: mpsc::Sender<T>, message: T, delay: Duration, shutdown: CancellationToken) -> Self {
        Self {
            tx,
            message,
            delay,
            shutdown,
            pending: None,
        }
    }

    /// The fixed delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether a send is scheduled and has not yet fired or been cancelled.
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|token| !token.is_cancelled() && !self.tx.is_closed())
    }

    /// Schedule a send, replacing any pending one.
    pub fn schedule(&mut self) {
        self.cancel();

        let token = self.shutdown.child_token();
        self.pending = Some(token.clone());

        let tx = self.tx.clone();
        let message = self.message.clone();
        let delay = self.delay;
        debug!("Rescan scheduled in {:?}", delay);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("Scheduled rescan cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    // Mark as fired so is_pending() turns false.
                    token.cancel();
                    if tx.send(message).await.is_err() {
                        trace!("Rescan target closed before delay elapsed");
                    }
                }
            }
        });
    }

    /// Cancel the pending send, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

impl<T> Drop for RescanScheduler<T> {
    fn drop(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(delay: Duration) -> (RescanScheduler<u32>, mpsc::Receiver<u32>, CancellationToken) {
        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        (
            RescanScheduler::new(tx, 7, delay, shutdown.clone()),
            rx,
            shutdown,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay_and_not_before() {
        let (mut scheduler, mut rx, _shutdown) = scheduler(Duration::from_secs(2));
        scheduler.schedule();
        assert!(scheduler.is_pending());

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_send() {
        let (mut scheduler, mut rx, _shutdown) = scheduler(Duration::from_secs(2));
        scheduler.schedule();
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.cancel();
        assert!(!scheduler.is_pending());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_restarts_delay() {
        let (mut scheduler, mut rx, _shutdown) = scheduler(Duration::from_secs(2));
        scheduler.schedule();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.schedule();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending() {
        let (mut scheduler, mut rx, shutdown) = scheduler(Duration::from_secs(2));
        scheduler.schedule();
        shutdown.cancel();
        assert!(!scheduler.is_pending());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
    }
}
