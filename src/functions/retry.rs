use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::backoff::RetryConfig;
use crate::config::RetrySettings;
use crate::error::StoreError;
use crate::services::{DeliveryClient, preview};
use crate::store::PendingStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryTickReport {
    pub delivered: u32,
    pub failed: u32,
    /// Records whose backoff had not elapsed yet.
    pub deferred: u32,
    /// Records that can never be delivered and were removed.
    pub discarded: u32,
}

/// One pass over the pending store: every due record gets one delivery
/// attempt, sequentially in insertion order.
pub async fn retry_tick(
    client: &dyn DeliveryClient,
    store: &dyn PendingStore,
    backoff: &RetryConfig,
    now: DateTime<Utc>,
) -> Result<RetryTickReport, StoreError> {
    let pending = store.list_unsent().await?;
    let mut report = RetryTickReport::default();

    if pending.is_empty() {
        return Ok(report);
    }

    tracing::debug!(count = pending.len(), "retry: processing pending messages");

    for record in &pending {
        if !record.is_due(now) {
            report.deferred += 1;
            continue;
        }

        let attempt = record.attempt_count.max(0) as u32 + 1;
        let target = match record.target() {
            Ok(target) => target,
            Err(e) => {
                tracing::error!(
                    pending_id = record.id,
                    recipient_id = %record.recipient_id,
                    error = %e,
                    body = %preview(&record.body),
                    "retry: discarding undeliverable record"
                );
                if let Err(e) = store.delete_sent(&record.recipient_id, &record.body).await {
                    tracing::warn!(pending_id = record.id, error = %e, "retry: failed to discard record");
                }
                report.discarded += 1;
                continue;
            }
        };

        match client.send(&target, &record.body).await {
            Ok(_) => {
                tracing::info!(
                    pending_id = record.id,
                    recipient_id = %record.recipient_id,
                    attempt,
                    "retry: delivered"
                );
                if let Err(e) = store.delete_sent(&record.recipient_id, &record.body).await {
                    // stays pending and is sent again next tick
                    tracing::warn!(pending_id = record.id, error = %e, "retry: delivered but not cleared");
                }
                report.delivered += 1;
            }
            Err(err) => {
                let delay = backoff.delay_for_attempt(attempt - 1);
                let next_attempt_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                tracing::warn!(
                    pending_id = record.id,
                    recipient_id = %record.recipient_id,
                    attempt,
                    error = %err,
                    body = %preview(&record.body),
                    next_attempt_at = %next_attempt_at,
                    "retry: still undeliverable"
                );
                if let Err(e) = store
                    .record_failure(record.id, &err.to_string(), next_attempt_at)
                    .await
                {
                    tracing::warn!(pending_id = record.id, error = %e, "retry: failed to record attempt");
                }
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Periodic retry loop. Runs until the shutdown flag flips to `true`.
pub struct RetryScheduler {
    client: Arc<dyn DeliveryClient>,
    store: Arc<dyn PendingStore>,
    settings: RetrySettings,
}

impl RetryScheduler {
    pub fn new(
        client: Arc<dyn DeliveryClient>,
        store: Arc<dyn PendingStore>,
        settings: RetrySettings,
    ) -> Self {
        Self {
            client,
            store,
            settings,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            "retry: scheduler started"
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // a dropped sender also means shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.settings.interval) => {
                    match retry_tick(
                        self.client.as_ref(),
                        self.store.as_ref(),
                        &self.settings.backoff,
                        Utc::now(),
                    )
                    .await
                    {
                        Ok(report) if report.delivered + report.failed + report.discarded > 0 => {
                            tracing::info!(
                                delivered = report.delivered,
                                failed = report.failed,
                                discarded = report.discarded,
                                deferred = report.deferred,
                                "retry tick"
                            )
                        }
                        Err(e) => tracing::error!(error = %e, "retry tick failed"),
                        _ => {}
                    }
                }
            }
        }
        tracing::info!("retry: scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::delivery::tests::{ScriptedClient, rejected};
    use crate::schema::{Channel, ReplyTarget};
    use crate::services::Ack;
    use crate::store::MemoryPendingStore;
    use std::time::Duration;

    fn dm(recipient: &str) -> ReplyTarget {
        ReplyTarget::DirectMessage {
            recipient_id: recipient.to_string(),
            channel: Channel::Facebook,
        }
    }

    fn has(rows: &[crate::schema::PendingMessage], recipient: &str, body: &str) -> bool {
        rows.iter()
            .any(|r| r.recipient_id == recipient && r.body == body && !r.sent)
    }

    #[tokio::test]
    async fn fails_then_succeeds_on_second_tick() {
        let store = MemoryPendingStore::new();
        store.insert_if_absent(&dm("u1"), "hello").await.unwrap();
        let client = ScriptedClient::new(vec![rejected(), Ok(Ack::default())]);
        let backoff = RetryConfig::NO_DELAY;

        let first = retry_tick(&client, &store, &backoff, Utc::now()).await.unwrap();
        assert_eq!(first.failed, 1);
        let rows = store.list_unsent().await.unwrap();
        assert!(has(&rows, "u1", "hello"));
        assert_eq!(rows[0].attempt_count, 1);

        let second = retry_tick(&client, &store, &backoff, Utc::now()).await.unwrap();
        assert_eq!(second.delivered, 1);
        assert!(!has(&store.list_unsent().await.unwrap(), "u1", "hello"));
        assert_eq!(client.sent_count(), 2);
    }

    #[tokio::test]
    async fn delivers_after_n_ticks() {
        let store = MemoryPendingStore::new();
        store.insert_if_absent(&dm("u1"), "hello").await.unwrap();
        let n = 4;
        let mut script: Vec<_> = (1..n).map(|_| rejected()).collect();
        script.push(Ok(Ack::default()));
        let client = ScriptedClient::new(script);

        for tick in 1..=n {
            retry_tick(&client, &store, &RetryConfig::NO_DELAY, Utc::now())
                .await
                .unwrap();
            let still_pending = has(&store.list_unsent().await.unwrap(), "u1", "hello");
            assert_eq!(still_pending, tick < n, "tick {tick}");
        }
    }

    #[tokio::test]
    async fn every_record_is_attempted_in_order() {
        let store = MemoryPendingStore::new();
        store.insert_if_absent(&dm("a"), "1").await.unwrap();
        store.insert_if_absent(&dm("b"), "2").await.unwrap();
        store.insert_if_absent(&dm("c"), "3").await.unwrap();
        let client = ScriptedClient::new(vec![Ok(Ack::default()), rejected(), Ok(Ack::default())]);

        let report = retry_tick(&client, &store, &RetryConfig::NO_DELAY, Utc::now())
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        let order: Vec<String> = client
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.recipient_id().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        let rows = store.list_unsent().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recipient_id, "b");
    }

    #[tokio::test]
    async fn unroutable_records_are_discarded() {
        let store = MemoryPendingStore::new();
        store.insert_if_absent(&dm("u1"), "hello").await.unwrap();
        store.insert_if_absent(&dm("u2"), "bye").await.unwrap();
        let id = store.list_unsent().await.unwrap()[0].id;
        store.set_target_kind(id, "whatsapp").await;
        let client = ScriptedClient::default();

        let report = retry_tick(&client, &store, &RetryConfig::NO_DELAY, Utc::now())
            .await
            .unwrap();

        assert_eq!(report.discarded, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(client.sent_count(), 1);
        assert!(store.list_unsent().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backoff_defers_until_due() {
        let store = MemoryPendingStore::new();
        store.insert_if_absent(&dm("u1"), "hello").await.unwrap();
        let client = ScriptedClient::new(vec![rejected(), Ok(Ack::default())]);
        let backoff = RetryConfig::new(
            u32::MAX,
            Duration::from_secs(60),
            Duration::from_secs(3600),
            2.0,
        );
        let start = Utc::now();

        retry_tick(&client, &store, &backoff, start).await.unwrap();
        let early = retry_tick(&client, &store, &backoff, start + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(early.deferred, 1);
        assert_eq!(client.sent_count(), 1);

        let due = retry_tick(&client, &store, &backoff, start + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(due.delivered, 1);
        assert!(store.list_unsent().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_ticks_until_shutdown() {
        let store = Arc::new(MemoryPendingStore::new());
        store.insert_if_absent(&dm("u1"), "hello").await.unwrap();
        let client = Arc::new(ScriptedClient::new(vec![rejected(), Ok(Ack::default())]));
        let settings = RetrySettings {
            interval: Duration::from_secs(60),
            backoff: RetryConfig::NO_DELAY,
        };
        let (tx, rx) = watch::channel(false);
        let scheduler = RetryScheduler::new(client.clone(), store.clone(), settings);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(client.sent_count(), 1);
        assert_eq!(store.list_unsent().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.sent_count(), 2);
        assert!(store.list_unsent().await.unwrap().is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
