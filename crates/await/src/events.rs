//! Event plumbing shared by the awaiters: kind-scoped subscriptions, the
//! resettable settlement timer and the aggregation ticker.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use converge_core::WatchEvent;
use converge_kubehub::{ClientError, ResourceClient};
use futures::StreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, warn};

/// Live subscription to one resource collection.
///
/// A background task forwards the watch into a bounded channel; dropping the
/// source stops the task.
pub struct EventSource {
    rx: mpsc::Receiver<WatchEvent>,
    task: Option<JoinHandle<()>>,
}

impl EventSource {
    pub async fn subscribe(client: Arc<dyn ResourceClient>, key: String, cap: usize) -> Result<Self, ClientError> {
        let mut stream = client.watch().await?;
        let (tx, rx) = mpsc::channel(cap);
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(ev) => {
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        counter!("await_watch_errors", 1u64);
                        warn!(gvk = %key, error = %e, "watch error");
                    }
                }
            }
            debug!(gvk = %key, "subscription ended");
        });
        Ok(Self { rx, task: Some(task) })
    }

    /// Source fed directly from a channel.
    pub fn from_channel(rx: mpsc::Receiver<WatchEvent>) -> Self {
        Self { rx, task: None }
    }

    /// `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Single resettable timer: each `reset` restarts the quiet period, and it
/// fires once the period elapses with no further reset.
pub struct SettleTimer {
    sleep: Pin<Box<Sleep>>,
    period: Duration,
    armed: bool,
}

impl SettleTimer {
    pub fn new(period: Duration) -> Self {
        Self { sleep: Box::pin(tokio::time::sleep(period)), period, armed: false }
    }

    pub fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.period);
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Completes when the armed timer elapses. Pending forever when disarmed.
    pub async fn fired(&mut self) {
        if !self.armed {
            futures::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

/// Interval whose first tick is one full period away.
pub fn ticker(period: Duration) -> Interval {
    let mut iv = tokio::time::interval_at(Instant::now() + period, period);
    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn settle_timer_restarts_on_reset() {
        let mut t = SettleTimer::new(Duration::from_secs(10));
        assert!(!t.is_armed());
        let start = Instant::now();
        t.reset();
        tokio::time::sleep(Duration::from_secs(6)).await;
        t.reset();
        t.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(16));
        assert!(!t.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let mut t = SettleTimer::new(Duration::from_secs(1));
        let res = tokio::time::timeout(Duration::from_secs(30), t.fired()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn channel_source_yields_then_closes() {
        let (tx, rx) = mpsc::channel(4);
        let mut src = EventSource::from_channel(rx);
        let obj = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}
        }))
        .expect("valid object");
        tx.send(WatchEvent::added(obj)).await.expect("send");
        drop(tx);
        assert!(src.recv().await.is_some());
        assert!(src.recv().await.is_none());
    }
}
