use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::BotIdentity;
use crate::error::ClassificationError;
use crate::functions::delivery::{DeliveryOutcome, Outbound};
use crate::schema::InboundEvent;
use crate::services::{AiService, QueryKind, ReplyPrompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SelfAuthored,
    EmptyText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    /// Classification or generation failed; no reply was attempted.
    Dropped,
    Sent(DeliveryOutcome),
}

/// Turns inbound comments and DMs into replies and hands them to the
/// outbound path.
pub struct Dispatcher {
    ai: Arc<dyn AiService>,
    outbound: Outbound,
    identity: BotIdentity,
    location_template: String,
}

fn render_location_reply(template: &str, actor_name: Option<&str>) -> String {
    let name = actor_name.map(str::trim).filter(|n| !n.is_empty());
    match name {
        Some(name) => template.replace("{name}", name),
        // "Hi {name}!" -> "Hi!"
        None => template
            .replace(" {name}", "")
            .replace("{name}", "")
            .trim()
            .to_string(),
    }
}

impl Dispatcher {
    pub fn new(
        ai: Arc<dyn AiService>,
        outbound: Outbound,
        identity: BotIdentity,
        location_template: String,
    ) -> Self {
        Self {
            ai,
            outbound,
            identity,
            location_template,
        }
    }

    fn skip_reason(&self, event: &InboundEvent) -> Option<SkipReason> {
        if event.is_from_page()
            || self
                .identity
                .is_self(event.actor_id.as_deref(), event.actor_name.as_deref())
        {
            return Some(SkipReason::SelfAuthored);
        }
        if event.trimmed_text().is_none() {
            return Some(SkipReason::EmptyText);
        }
        None
    }

    async fn compose_reply(&self, event: &InboundEvent, text: &str) -> Result<String, ClassificationError> {
        let kind = self.ai.classify(text).await?;
        tracing::debug!(?kind, "dispatch: classified");

        let reply = match kind {
            QueryKind::Location => {
                render_location_reply(&self.location_template, event.actor_name.as_deref())
            }
            QueryKind::General => {
                self.ai
                    .generate(&ReplyPrompt {
                        source: event.source,
                        text,
                        actor_name: event.actor_name.as_deref(),
                    })
                    .await?
            }
        };

        let reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(ClassificationError(anyhow::anyhow!("generated reply is empty")));
        }
        Ok(reply)
    }

    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        if let Some(reason) = self.skip_reason(event) {
            tracing::debug!(?reason, origin_id = %event.origin_id, "dispatch: skipping event");
            return DispatchOutcome::Skipped(reason);
        }
        let text = event.trimmed_text().unwrap_or_default();

        tracing::info!(
            source = ?event.source,
            channel = ?event.channel,
            origin_id = %event.origin_id,
            actor_id = ?event.actor_id,
            "dispatch: inbound event"
        );

        let reply = match self.compose_reply(event, text).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(origin_id = %event.origin_id, error = %e, "dispatch: no reply generated");
                return DispatchOutcome::Dropped;
            }
        };

        let target = event.reply_target();
        DispatchOutcome::Sent(self.outbound.deliver(&target, &reply).await)
    }

    /// Spawns one task per event so a failure in one never holds up the rest.
    pub fn dispatch_batch(self: &Arc<Self>, events: Vec<InboundEvent>) -> JoinSet<DispatchOutcome> {
        let mut tasks = JoinSet::new();
        for event in events {
            let dispatcher = Arc::clone(self);
            let span = tracing::info_span!("dispatch", trace_id = %Uuid::new_v4());
            tasks.spawn(async move { dispatcher.dispatch(&event).await }.instrument(span));
        }
        tasks
    }
}

/// Awaits a spawned batch and logs tasks that panicked.
pub async fn drain_batch(mut tasks: JoinSet<DispatchOutcome>) -> Vec<DispatchOutcome> {
    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!(error = %e, "dispatch: event task failed"),
        }
    }
    outcomes
}
