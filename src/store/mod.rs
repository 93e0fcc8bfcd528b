pub mod memory;
pub mod postgres;

pub use memory::MemoryPendingStore;
pub use postgres::PgPendingStore;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::schema::{PendingMessage, ReplyTarget};

/// Durable queue of replies that failed delivery.
///
/// Records are unique per `(recipient_id, body)`; implementations enforce that
/// atomically so the webhook path and the retry loop can share one store.
#[async_trait::async_trait]
pub trait PendingStore: Send + Sync {
    /// Returns `true` when a new record was created, `false` when the tuple was
    /// already pending.
    async fn insert_if_absent(&self, target: &ReplyTarget, body: &str) -> Result<bool, StoreError>;

    /// Removes the matching record. Deleting a missing tuple is not an error.
    async fn delete_sent(&self, recipient_id: &str, body: &str) -> Result<u64, StoreError>;

    /// Unsent records in insertion order.
    async fn list_unsent(&self) -> Result<Vec<PendingMessage>, StoreError>;

    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn close(&self) {}
}
