use std::sync::Arc;

use crate::error::DeliveryError;
use crate::schema::ReplyTarget;
use crate::services::{DeliveryClient, preview};
use crate::store::PendingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Send failed; the reply is queued for the retry loop.
    Pending,
    /// Send failed and could not be queued.
    Lost,
}

/// Send path shared by the dispatcher: one attempt through the delivery
/// client, falling back to the pending store.
#[derive(Clone)]
pub struct Outbound {
    client: Arc<dyn DeliveryClient>,
    store: Arc<dyn PendingStore>,
}

/// Failures worth queueing. Both remote rejections and transport failures are
/// queued: a lost response may still have been a rejection.
fn should_queue(err: &DeliveryError) -> bool {
    matches!(
        err,
        DeliveryError::RemoteRejection { .. } | DeliveryError::Transport(_)
    )
}

impl Outbound {
    pub fn new(client: Arc<dyn DeliveryClient>, store: Arc<dyn PendingStore>) -> Self {
        Self { client, store }
    }

    pub async fn deliver(&self, target: &ReplyTarget, body: &str) -> DeliveryOutcome {
        match self.client.send(target, body).await {
            Ok(_) => {
                // a direct success also settles any earlier queued copy
                match self.store.delete_sent(target.recipient_id(), body).await {
                    Ok(n) if n > 0 => {
                        tracing::info!(recipient_id = target.recipient_id(), "delivery: cleared stale pending copy")
                    }
                    Err(e) => {
                        tracing::warn!(recipient_id = target.recipient_id(), error = %e, "delivery: failed to clear pending copy")
                    }
                    _ => {}
                }
                DeliveryOutcome::Delivered
            }
            Err(err) if should_queue(&err) => {
                match self.store.insert_if_absent(target, body).await {
                    Ok(created) => {
                        tracing::info!(
                            recipient_id = target.recipient_id(),
                            kind = target.kind().as_str(),
                            created,
                            error = %err,
                            "delivery: queued for retry"
                        );
                        DeliveryOutcome::Pending
                    }
                    Err(store_err) => {
                        tracing::error!(
                            recipient_id = target.recipient_id(),
                            error = %err,
                            store_error = %store_err,
                            body = %preview(body),
                            "delivery: failed and could not be queued"
                        );
                        DeliveryOutcome::Lost
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    recipient_id = target.recipient_id(),
                    error = %err,
                    "delivery: dropped undeliverable reply"
                );
                DeliveryOutcome::Lost
            }
        }
    }
}
