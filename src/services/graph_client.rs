use serde::Deserialize;

use crate::backoff::RetryConfig;
use crate::config::GraphConfig;
use crate::error::DeliveryError;
use crate::schema::{Channel, ReplyTarget};

const PREVIEW_CHARS: usize = 80;

/// Acknowledgment returned by the platform for a delivered reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub message_id: Option<String>,
}

#[async_trait::async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(&self, target: &ReplyTarget, body: &str) -> Result<Ack, DeliveryError>;
}

/// Delivers replies through the Graph API: comment replies with the page
/// token, Messenger DMs with the Messenger token and Instagram DMs with the
/// Instagram token.
pub struct GraphClient {
    client: reqwest::Client,
    config: GraphConfig,
    transport_retry: RetryConfig,
}

#[derive(Deserialize)]
struct GraphResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

pub fn preview(body: &str) -> String {
    if body.chars().count() <= PREVIEW_CHARS {
        body.to_string()
    } else {
        let mut out: String = body.chars().take(PREVIEW_CHARS).collect();
        out.push('…');
        out
    }
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let transport_retry = RetryConfig::TRANSPORT.with_max_retries(config.transport_retries);
        Ok(Self {
            client,
            config,
            transport_retry,
        })
    }

    pub fn with_transport_retry(mut self, retry: RetryConfig) -> Self {
        self.transport_retry = retry;
        self
    }

    fn request_for(&self, target: &ReplyTarget, body: &str) -> (String, &str, serde_json::Value) {
        let base = self.config.base_url.trim_end_matches('/');
        match target {
            ReplyTarget::CommentReply { comment_id } => (
                format!("{base}/{comment_id}/comments"),
                self.config.page_token.as_str(),
                serde_json::json!({ "message": body }),
            ),
            ReplyTarget::DirectMessage {
                recipient_id,
                channel: Channel::Facebook,
            } => (
                format!("{base}/me/messages"),
                self.config.messenger_token.as_str(),
                serde_json::json!({
                    "recipient": { "id": recipient_id },
                    "message": { "text": body },
                    // tagged so replies outside the 24h window are accepted
                    "messaging_type": "MESSAGE_TAG",
                    "tag": "CONFIRMED_EVENT_UPDATE",
                }),
            ),
            ReplyTarget::DirectMessage {
                recipient_id,
                channel: Channel::Instagram,
            } => (
                format!("{base}/me/messages"),
                self.config.instagram_token.as_str(),
                serde_json::json!({
                    "recipient": { "id": recipient_id },
                    "message": { "text": body },
                }),
            ),
        }
    }

    async fn send_once(&self, target: &ReplyTarget, body: &str) -> Result<Ack, DeliveryError> {
        let (url, token, payload) = self.request_for(target, body);
        let response = self
            .client
            .post(url)
            .query(&[("access_token", token)])
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::RemoteRejection {
                status: status.as_u16(),
                body,
            });
        }

        let ack = match response.json::<GraphResponse>().await {
            Ok(parsed) => Ack {
                message_id: parsed.message_id.or(parsed.id),
            },
            // delivered, but the ack body was not what we expected
            Err(_) => Ack::default(),
        };
        Ok(ack)
    }
}

#[async_trait::async_trait]
impl DeliveryClient for GraphClient {
    async fn send(&self, target: &ReplyTarget, body: &str) -> Result<Ack, DeliveryError> {
        if body.trim().is_empty() {
            return Err(DeliveryError::EmptyBody);
        }
        if target.recipient_id().trim().is_empty() {
            return Err(DeliveryError::InvalidTarget("empty recipient id".to_string()));
        }

        let kind = target.kind().as_str();
        let recipient_id = target.recipient_id();
        let mut attempt = 0u32;
        loop {
            match self.send_once(target, body).await {
                Ok(ack) => {
                    tracing::info!(
                        kind,
                        recipient_id,
                        attempt = attempt + 1,
                        message_id = ?ack.message_id,
                        body = %preview(body),
                        "delivery: sent"
                    );
                    return Ok(ack);
                }
                Err(DeliveryError::Transport(reason)) if attempt < self.transport_retry.max_retries => {
                    let delay = self.transport_retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        kind,
                        recipient_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        body = %preview(body),
                        "delivery: transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        kind,
                        recipient_id,
                        attempt = attempt + 1,
                        status = ?err.status(),
                        error = %err,
                        body = %preview(body),
                        "delivery: failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}
