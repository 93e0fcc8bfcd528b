use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::PendingStore;
use crate::error::StoreError;
use crate::schema::{PendingMessage, ReplyTarget};

/// Process-local store used when no database is configured.
/// Pending replies do not survive a restart.
#[derive(Default)]
pub struct MemoryPendingStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    rows: Vec<PendingMessage>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a row's stored target kind, as a foreign writer might.
    #[cfg(test)]
    pub(crate) async fn set_target_kind(&self, id: i64, kind: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.rows.iter_mut().find(|row| row.id == id) {
            row.target_kind = kind.to_string();
        }
    }
}

#[async_trait::async_trait]
impl PendingStore for MemoryPendingStore {
    async fn insert_if_absent(&self, target: &ReplyTarget, body: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let recipient_id = target.recipient_id();
        if inner
            .rows
            .iter()
            .any(|row| row.recipient_id == recipient_id && row.body == body)
        {
            return Ok(false);
        }

        inner.next_id += 1;
        let now = Utc::now();
        let row = PendingMessage {
            id: inner.next_id,
            recipient_id: recipient_id.to_string(),
            body: body.to_string(),
            target_kind: target.kind().as_str().to_string(),
            sent: false,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
        };
        inner.rows.push(row);
        Ok(true)
    }

    async fn delete_sent(&self, recipient_id: &str, body: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.rows.len();
        inner
            .rows
            .retain(|row| !(row.recipient_id == recipient_id && row.body == body));
        Ok((before - inner.rows.len()) as u64)
    }

    async fn list_unsent(&self) -> Result<Vec<PendingMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.iter().filter(|row| !row.sent).cloned().collect())
    }

    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.rows.iter_mut().find(|row| row.id == id) {
            row.attempt_count += 1;
            row.last_error = Some(error.to_string());
            row.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }
}
