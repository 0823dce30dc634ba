//! Outbound notification dispatch.
//!
//! Callback handlers never POST while holding their transaction; they queue
//! notifications in the store and this dispatcher flushes the queue after
//! commit. Delivery is retried with exponential backoff and abandoned after
//! a configured number of attempts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::OutboxConfig;
use crate::error::Result;
use crate::store::models::Notification;
use crate::store::Store;

const BATCH_SIZE: usize = 32;

/// Delivery of one notification payload.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, url: &str, payload: &serde_json::Value) -> Result<()>;
}

/// reqwest-backed sender.
pub struct HttpSender {
    http: reqwest::Client,
}

impl HttpSender {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, url: &str, payload: &serde_json::Value) -> Result<()> {
        self.http
            .post(url)
            .json(payload)
            .send()
            .await?
            .error_for_status()
            .map_err(crate::error::Error::Http)?;
        Ok(())
    }
}

/// Polls the notification queue and delivers due entries.
pub struct Dispatcher<S: Sender> {
    store: Store,
    config: OutboxConfig,
    sender: S,
}

impl<S: Sender> Dispatcher<S> {
    pub fn new(store: Store, config: OutboxConfig, sender: S) -> Self {
        Self {
            store,
            config,
            sender,
        }
    }

    /// Run forever, polling at the configured interval.
    pub async fn run(self) {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "notification dispatch tick failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Deliver one batch of due notifications. Each delivery outcome is
    /// recorded in its own transaction so one slow endpoint cannot hold
    /// the rest of the batch.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self
            .store
            .read(|tx| tx.due_notifications(now, BATCH_SIZE))
            .await?;

        let mut delivered = 0;
        for notification in due {
            match self.sender.send(&notification.url, &notification.payload).await {
                Ok(()) => {
                    debug!(id = %notification.id, url = %notification.url, "notification sent");
                    self.store
                        .with_tx(|tx| tx.mark_notification_sent(&notification.id))
                        .await?;
                    delivered += 1;
                }
                Err(e) => {
                    self.record_failure(&notification, &e).await?;
                }
            }
        }
        Ok(delivered)
    }

    async fn record_failure(&self, notification: &Notification, error: &crate::error::Error) -> Result<()> {
        let attempts = notification.attempts + 1;
        if attempts >= self.config.max_attempts {
            warn!(
                id = %notification.id,
                url = %notification.url,
                attempts,
                error = %error,
                "notification abandoned"
            );
            self.store
                .with_tx(|tx| tx.abandon_notification(&notification.id, attempts))
                .await
        } else {
            let delay = self.retry_delay(attempts);
            debug!(
                id = %notification.id,
                attempts,
                delay_secs = delay.num_seconds(),
                error = %error,
                "notification delivery failed, rescheduling"
            );
            let next = Utc::now() + delay;
            self.store
                .with_tx(|tx| tx.reschedule_notification(&notification.id, attempts, next))
                .await
        }
    }

    /// Base delay doubled per prior attempt, capped at one hour.
    fn retry_delay(&self, attempts: u32) -> chrono::Duration {
        let base = self.config.retry_delay_seconds;
        let exponent = attempts.saturating_sub(1).min(16);
        let seconds = base.saturating_mul(1u64 << exponent).min(3600);
        chrono::Duration::seconds(seconds as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct StubSender {
        fail: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl StubSender {
        fn new(fail: bool) -> Self {
            Self {
                fail: AtomicBool::new(fail),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Sender for StubSender {
        async fn send(&self, url: &str, _payload: &serde_json::Value) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(crate::error::Error::Internal("unreachable".into()));
            }
            self.sent.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    fn config(max_attempts: u32) -> OutboxConfig {
        OutboxConfig {
            max_attempts,
            retry_delay_seconds: 10,
            poll_interval_ms: 10,
        }
    }

    async fn enqueue(store: &Store, url: &str) -> String {
        store
            .with_tx(|tx| tx.enqueue_notification(None, url, &json!({"n": 1})))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_delivers_and_marks_sent() {
        let store = Store::open_in_memory().unwrap();
        enqueue(&store, "http://hooks/a").await;
        enqueue(&store, "http://hooks/b").await;

        let dispatcher = Dispatcher::new(store.clone(), config(5), StubSender::new(false));
        assert_eq!(dispatcher.tick().await.unwrap(), 2);
        assert_eq!(dispatcher.tick().await.unwrap(), 0);

        let sent = dispatcher.sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_reschedules_with_backoff() {
        let store = Store::open_in_memory().unwrap();
        let id = enqueue(&store, "http://hooks/down").await;

        let dispatcher = Dispatcher::new(store.clone(), config(5), StubSender::new(true));
        assert_eq!(dispatcher.tick().await.unwrap(), 0);

        // Rescheduled into the future, so no longer due.
        let due = store
            .read(|tx| tx.due_notifications(Utc::now(), 10))
            .await
            .unwrap();
        assert!(due.is_empty());

        // Once the endpoint recovers and the retry comes due, it delivers.
        dispatcher.sender.fail.store(false, Ordering::SeqCst);
        store
            .with_tx(|tx| tx.reschedule_notification(&id, 1, Utc::now()))
            .await
            .unwrap();
        assert_eq!(dispatcher.tick().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_after_max_attempts() {
        let store = Store::open_in_memory().unwrap();
        let id = enqueue(&store, "http://hooks/gone").await;

        let dispatcher = Dispatcher::new(store.clone(), config(2), StubSender::new(true));
        dispatcher.tick().await.unwrap();
        store
            .with_tx(|tx| tx.reschedule_notification(&id, 1, Utc::now()))
            .await
            .unwrap();
        dispatcher.tick().await.unwrap();

        // Second failure hits max_attempts; nothing further is due even
        // far in the future.
        let due = store
            .read(|tx| tx.due_notifications(Utc::now() + chrono::Duration::days(365), 10))
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let store = Store::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(store, config(5), StubSender::new(false));
        assert_eq!(dispatcher.retry_delay(1).num_seconds(), 10);
        assert_eq!(dispatcher.retry_delay(2).num_seconds(), 20);
        assert_eq!(dispatcher.retry_delay(3).num_seconds(), 40);
        assert_eq!(dispatcher.retry_delay(30).num_seconds(), 3600);
    }
}
