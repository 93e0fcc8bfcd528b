//! Webhook ingress.
//!
//! `GET /webhook` answers the subscription handshake, `POST /webhook` turns a
//! batch of page or Instagram notifications into [`InboundEvent`]s, spawns one
//! dispatch task per event and acknowledges immediately.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::functions::dispatch::{Dispatcher, drain_batch};
use crate::schema::{Channel, EventSource, InboundEvent};

pub const EVENT_RECEIVED: &str = "EVENT_RECEIVED";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    verify_token: String,
    dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(verify_token: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                verify_token: verify_token.into(),
                dispatcher,
            }),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/webhook", get(verify).post(receive))
        .with_state(state)
}

async fn index() -> &'static str {
    "auto-responder running"
}

#[derive(Debug, Default, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Returns the challenge to echo when the handshake token matches.
fn verify_subscription(expected: &str, params: &VerifyParams) -> Option<String> {
    if params.mode.as_deref().is_some_and(|mode| mode != "subscribe") {
        return None;
    }
    match params.verify_token.as_deref() {
        Some(token) if !expected.is_empty() && token == expected => {
            Some(params.challenge.clone().unwrap_or_default())
        }
        _ => None,
    }
}

async fn verify(
    State(state): State<AppState>,
    Query(params): Query<VerifyParams>,
) -> (StatusCode, String) {
    match verify_subscription(&state.inner.verify_token, &params) {
        Some(challenge) => {
            tracing::info!("webhook: subscription verified");
            (StatusCode::OK, challenge)
        }
        None => {
            tracing::warn!("webhook: invalid verification token");
            (StatusCode::FORBIDDEN, "invalid verification token".to_string())
        }
    }
}

async fn receive(State(state): State<AppState>, body: Bytes) -> (StatusCode, &'static str) {
    let events = match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => parse_events(payload),
        Err(e) => {
            tracing::warn!(error = %e, "webhook: unreadable payload");
            Vec::new()
        }
    };

    if !events.is_empty() {
        tracing::debug!(count = events.len(), "webhook: dispatching batch");
        let tasks = state.inner.dispatcher.dispatch_batch(events);
        tokio::spawn(drain_batch(tasks));
    }

    (StatusCode::OK, EVENT_RECEIVED)
}

/// Top level of a webhook delivery. Entries stay raw so one malformed entry
/// does not cost the rest of the batch.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct Entry {
    /// The page (or Instagram account) the notification is for.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<serde_json::Value>,
    #[serde(default)]
    pub messaging: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: FeedValue,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedValue {
    pub item: Option<String>,
    pub verb: Option<String>,
    pub comment_id: Option<String>,
    pub message: Option<String>,
    pub from: Option<Actor>,
}

#[derive(Debug, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessagingEvent {
    #[serde(default)]
    pub sender: Option<Actor>,
    #[serde(default)]
    pub message: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
}

fn decode<T: DeserializeOwned>(value: serde_json::Value, kind: &'static str) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::warn!(kind, error = %e, "webhook: skipping malformed item");
            None
        }
    }
}

fn comment_event(change: Change, page_id: Option<&str>) -> Option<InboundEvent> {
    if change.field != "feed" {
        return None;
    }
    let value = change.value;
    if value.item.as_deref() != Some("comment") {
        return None;
    }
    // edits and removals also arrive as feed changes
    if value.verb.as_deref().is_some_and(|verb| verb != "add") {
        return None;
    }
    let from = value.from;
    Some(InboundEvent {
        source: EventSource::Comment,
        channel: Channel::Facebook,
        page_id: page_id.map(str::to_string),
        origin_id: value.comment_id?,
        text: value.message,
        actor_id: from.as_ref().map(|a| a.id.clone()),
        actor_name: from.and_then(|a| a.name),
    })
}

fn message_event(
    event: MessagingEvent,
    channel: Channel,
    page_id: Option<&str>,
) -> Option<InboundEvent> {
    let message = event.message?;
    let sender = event.sender?;
    if message.is_echo {
        return None;
    }
    Some(InboundEvent {
        source: EventSource::DirectMessage,
        channel,
        page_id: page_id.map(str::to_string),
        origin_id: sender.id.clone(),
        text: message.text,
        actor_id: Some(sender.id),
        actor_name: sender.name,
    })
}

/// Flattens a webhook batch. Unknown objects and change kinds are ignored,
/// malformed entries and items are logged and skipped.
pub fn parse_events(payload: WebhookPayload) -> Vec<InboundEvent> {
    let channel = match payload.object.as_str() {
        "page" => Channel::Facebook,
        "instagram" => Channel::Instagram,
        other => {
            tracing::debug!(object = other, "webhook: ignoring object type");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for raw in payload.entry {
        let Some(entry) = decode::<Entry>(raw, "entry") else {
            continue;
        };
        let page_id = entry.id.as_deref();
        if channel == Channel::Facebook {
            events.extend(
                entry
                    .changes
                    .into_iter()
                    .filter_map(|raw| decode::<Change>(raw, "change"))
                    .filter_map(|change| comment_event(change, page_id)),
            );
        }
        events.extend(
            entry
                .messaging
                .into_iter()
                .filter_map(|raw| decode::<MessagingEvent>(raw, "messaging"))
                .filter_map(|m| message_event(m, channel, page_id)),
        );
    }
    events
}
