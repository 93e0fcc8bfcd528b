use chrono::{DateTime, Utc};

use crate::error::DeliveryError;
use crate::schema::{Channel, ReplyTarget};

/// Idempotent DDL for the retry queue.
///
/// Uniqueness is on `md5(body)` rather than `body` so long generated replies
/// stay under the btree tuple limit.
pub const PENDING_MESSAGES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS pending_messages (
    id bigserial PRIMARY KEY,
    recipient_id text NOT NULL,
    body text NOT NULL,
    target_kind text NOT NULL DEFAULT 'messenger',
    sent boolean NOT NULL DEFAULT false,
    attempt_count int NOT NULL DEFAULT 0,
    last_error text,
    next_attempt_at timestamptz NOT NULL DEFAULT now(),
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE UNIQUE INDEX IF NOT EXISTS pending_messages_recipient_body
    ON pending_messages (recipient_id, md5(body));
"#;

/// Which delivery variant a pending record must be retried through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Comment,
    Messenger,
    Instagram,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Comment => "comment",
            TargetKind::Messenger => "messenger",
            TargetKind::Instagram => "instagram",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "comment" => Some(TargetKind::Comment),
            "messenger" => Some(TargetKind::Messenger),
            "instagram" => Some(TargetKind::Instagram),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingMessage {
    pub id: i64,
    pub recipient_id: String,
    pub body: String,
    pub target_kind: String,
    pub sent: bool,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn target(&self) -> Result<ReplyTarget, DeliveryError> {
        let kind = TargetKind::parse(&self.target_kind).ok_or_else(|| {
            DeliveryError::InvalidTarget(format!("unknown target kind `{}`", self.target_kind))
        })?;
        let recipient_id = self.recipient_id.clone();
        Ok(match kind {
            TargetKind::Comment => ReplyTarget::CommentReply {
                comment_id: recipient_id,
            },
            TargetKind::Messenger => ReplyTarget::DirectMessage {
                recipient_id,
                channel: Channel::Facebook,
            },
            TargetKind::Instagram => ReplyTarget::DirectMessage {
                recipient_id,
                channel: Channel::Instagram,
            },
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.sent && self.next_attempt_at <= now
    }
}
