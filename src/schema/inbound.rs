use crate::schema::TargetKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Comment,
    DirectMessage,
}

/// Platform an event arrived on. Instagram DMs go through their own token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channel {
    #[default]
    Facebook,
    Instagram,
}

/// One comment or direct message pulled out of a webhook batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub source: EventSource,
    pub channel: Channel,
    /// Id of the page or account the webhook entry was delivered for.
    pub page_id: Option<String>,
    /// Comment id for comments, sender id for direct messages.
    pub origin_id: String,
    pub text: Option<String>,
    pub actor_id: Option<String>,
    pub actor_name: Option<String>,
}

impl InboundEvent {
    pub fn reply_target(&self) -> ReplyTarget {
        match self.source {
            EventSource::Comment => ReplyTarget::CommentReply {
                comment_id: self.origin_id.clone(),
            },
            EventSource::DirectMessage => ReplyTarget::DirectMessage {
                recipient_id: self.origin_id.clone(),
                channel: self.channel,
            },
        }
    }

    pub fn trimmed_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    /// The page's own replies come back through the same feed.
    pub fn is_from_page(&self) -> bool {
        matches!(
            (self.actor_id.as_deref(), self.page_id.as_deref()),
            (Some(actor), Some(page)) if !page.is_empty() && actor == page
        )
    }
}

/// Where a reply goes. Each variant is delivered with its own endpoint and
/// credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    CommentReply { comment_id: String },
    DirectMessage { recipient_id: String, channel: Channel },
}

impl ReplyTarget {
    /// The id pending records are keyed by.
    pub fn recipient_id(&self) -> &str {
        match self {
            ReplyTarget::CommentReply { comment_id } => comment_id,
            ReplyTarget::DirectMessage { recipient_id, .. } => recipient_id,
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            ReplyTarget::CommentReply { .. } => TargetKind::Comment,
            ReplyTarget::DirectMessage {
                channel: Channel::Facebook,
                ..
            } => TargetKind::Messenger,
            ReplyTarget::DirectMessage {
                channel: Channel::Instagram,
                ..
            } => TargetKind::Instagram,
        }
    }
}
