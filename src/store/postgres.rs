use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::PendingStore;
use crate::backoff::RetryConfig;
use crate::error::StoreError;
use crate::schema::{PENDING_MESSAGES_DDL, PendingMessage, ReplyTarget};

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PgPendingStore {
    pool: PgPool,
    schema_ready: AtomicBool,
}

fn pool_options() -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
}

impl PgPendingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: AtomicBool::new(false),
        }
    }

    /// Connects with bounded backoff. If the database stays unreachable the
    /// store falls back to a lazy pool: the process keeps serving webhooks and
    /// every later operation retries the connection.
    pub async fn connect(url: &str, backoff: RetryConfig) -> Result<Self, StoreError> {
        for attempt in 0..=backoff.max_retries {
            match pool_options().connect(url).await {
                Ok(pool) => {
                    let store = Self::new(pool);
                    if let Err(e) = store.ensure_schema().await {
                        tracing::warn!(error = %e, "store: schema setup deferred");
                    }
                    tracing::info!(attempt = attempt + 1, "store: connected");
                    return Ok(store);
                }
                Err(e) => match StoreError::from(e) {
                    StoreError::Unavailable(reason) => {
                        let delay = backoff.delay_for_attempt(attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %reason,
                            "store: database unreachable"
                        );
                        if attempt < backoff.max_retries {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    other => return Err(other),
                },
            }
        }

        tracing::error!("store: giving up on eager connect, continuing with lazy pool");
        let pool = pool_options().connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        sqlx::raw_sql(PENDING_MESSAGES_DDL)
            .execute(&self.pool)
            .await?;
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PendingStore for PgPendingStore {
    async fn insert_if_absent(&self, target: &ReplyTarget, body: &str) -> Result<bool, StoreError> {
        self.ensure_schema().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO pending_messages (recipient_id, body, target_kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (recipient_id, md5(body)) DO NOTHING
            "#,
        )
        .bind(target.recipient_id())
        .bind(body)
        .bind(target.kind().as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_sent(&self, recipient_id: &str, body: &str) -> Result<u64, StoreError> {
        self.ensure_schema().await?;
        let result =
            sqlx::query("DELETE FROM pending_messages WHERE recipient_id = $1 AND body = $2")
                .bind(recipient_id)
                .bind(body)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn list_unsent(&self) -> Result<Vec<PendingMessage>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query_as::<_, PendingMessage>(
            r#"
            SELECT id, recipient_id, body, target_kind, sent, attempt_count,
                   last_error, next_attempt_at, created_at
            FROM pending_messages
            WHERE sent = false
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            UPDATE pending_messages
            SET attempt_count = attempt_count + 1, last_error = $2, next_attempt_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Channel;

    // Run with: DATABASE_URL=postgres://... cargo test -- --ignored
    async fn setup() -> PgPendingStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgPendingStore::connect(&url, RetryConfig::STORE_CONNECT.with_max_retries(0))
            .await
            .unwrap()
    }

    fn unique_dm() -> ReplyTarget {
        ReplyTarget::DirectMessage {
            recipient_id: format!("test-{}", uuid::Uuid::new_v4()),
            channel: Channel::Facebook,
        }
    }

    fn rows_for<'a>(rows: &'a [PendingMessage], recipient: &str) -> Vec<&'a PendingMessage> {
        rows.iter().filter(|r| r.recipient_id == recipient).collect()
    }

    #[tokio::test]
    async fn unreachable_database_degrades_to_unavailable() {
        let backoff = RetryConfig::new(1, Duration::ZERO, Duration::ZERO, 2.0);
        let store = PgPendingStore::connect("postgres://u:p@127.0.0.1:1/x", backoff)
            .await
            .expect("falls back to a lazy pool");

        let target = unique_dm();
        assert!(matches!(
            store.insert_if_absent(&target, "hola").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.list_unsent().await,
            Err(StoreError::Unavailable(_))
        ));
        store.close().await;
    }

    #[tokio::test]
    #[ignore]
    async fn insert_twice_leaves_one_row() {
        let store = setup().await;
        let target = unique_dm();

        assert!(store.insert_if_absent(&target, "hello").await.unwrap());
        assert!(!store.insert_if_absent(&target, "hello").await.unwrap());

        let rows = store.list_unsent().await.unwrap();
        let mine = rows_for(&rows, target.recipient_id());
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].target_kind, "messenger");

        store.delete_sent(target.recipient_id(), "hello").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn concurrent_inserts_are_serialized_by_unique_index() {
        let store = std::sync::Arc::new(setup().await);
        let target = unique_dm();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let target = target.clone();
            handles.push(tokio::spawn(async move {
                store.insert_if_absent(&target, "hola").await.unwrap()
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        store.delete_sent(target.recipient_id(), "hola").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn delete_is_idempotent_and_failures_are_recorded() {
        let store = setup().await;
        let target = unique_dm();

        assert_eq!(store.delete_sent(target.recipient_id(), "x").await.unwrap(), 0);

        store.insert_if_absent(&target, "x").await.unwrap();
        let rows = store.list_unsent().await.unwrap();
        let id = rows_for(&rows, target.recipient_id())[0].id;
        let later = Utc::now() + chrono::Duration::minutes(1);
        store.record_failure(id, "boom", later).await.unwrap();

        let rows = store.list_unsent().await.unwrap();
        let row = rows_for(&rows, target.recipient_id())[0];
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("boom"));

        assert_eq!(store.delete_sent(target.recipient_id(), "x").await.unwrap(), 1);
        assert_eq!(store.delete_sent(target.recipient_id(), "x").await.unwrap(), 0);
    }
}
