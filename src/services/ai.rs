use crate::config::AiConfig;
use crate::schema::EventSource;
use crate::services::completion_client::{CompletionClient, CompletionRequest};

/// Coarse intent of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Asking where to buy or which distributor is nearby.
    Location,
    General,
}

#[derive(Debug, Clone)]
pub struct ReplyPrompt<'a> {
    pub source: EventSource,
    pub text: &'a str,
    pub actor_name: Option<&'a str>,
}

#[async_trait::async_trait]
pub trait AiService: Send + Sync {
    async fn classify(&self, text: &str) -> anyhow::Result<QueryKind>;
    async fn generate(&self, prompt: &ReplyPrompt<'_>) -> anyhow::Result<String>;
}

pub struct RealAiService {
    completion: CompletionClient,
    reply_model: String,
    classifier_model: String,
    company_name: String,
}

impl RealAiService {
    pub fn new(config: &AiConfig) -> anyhow::Result<Self> {
        Ok(Self {
            completion: CompletionClient::new(&config.base_url, &config.api_key)?,
            reply_model: config.reply_model.clone(),
            classifier_model: config.classifier_model.clone(),
            company_name: config.company_name.clone(),
        })
    }
}

#[async_trait::async_trait]
impl AiService for RealAiService {
    async fn classify(&self, text: &str) -> anyhow::Result<QueryKind> {
        let system = build_classifier_prompt(&self.company_name);
        let raw = self
            .completion
            .complete(CompletionRequest {
                model: &self.classifier_model,
                system: &system,
                user: text,
                temperature: 0.0,
                max_tokens: 4,
            })
            .await?;

        match parse_query_kind(&raw) {
            Some(kind) => Ok(kind),
            None => {
                let kind = keyword_fallback(text);
                tracing::debug!(label = %raw, ?kind, "classifier: unparseable label, using keywords");
                Ok(kind)
            }
        }
    }

    async fn generate(&self, prompt: &ReplyPrompt<'_>) -> anyhow::Result<String> {
        let system = build_system_prompt(prompt.source, &self.company_name);
        let user = build_user_prompt(prompt);
        self.completion
            .complete(CompletionRequest {
                model: &self.reply_model,
                system: &system,
                user: &user,
                temperature: 0.7,
                max_tokens: 512,
            })
            .await
    }
}

fn build_classifier_prompt(company: &str) -> String {
    format!(
        "You label customer messages sent to {company}. \
         Answer with exactly one word: `location` if the customer asks where to buy the products, \
         for a nearby store, distributor or point of sale; otherwise `general`."
    )
}

fn build_system_prompt(source: EventSource, company: &str) -> String {
    match source {
        EventSource::Comment => format!(
            "You are a professional assistant answering Facebook comments for {company}. \
             Reply to the comment in a personal way, addressing the commenter by name. \
             Keep it short and reply in the commenter's language."
        ),
        EventSource::DirectMessage => format!(
            "You are a professional assistant answering prospective customers of {company}. \
             Be friendly and concise, and reply in the customer's language."
        ),
    }
}

fn build_user_prompt(prompt: &ReplyPrompt<'_>) -> String {
    match (prompt.source, prompt.actor_name) {
        (EventSource::Comment, Some(name)) => {
            format!("Comment: \"{}\", Name: \"{}\"", prompt.text, name)
        }
        (EventSource::Comment, None) => format!("Comment: \"{}\"", prompt.text),
        (EventSource::DirectMessage, _) => prompt.text.to_string(),
    }
}

fn parse_query_kind(raw: &str) -> Option<QueryKind> {
    let label = raw
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_ascii_lowercase();
    match label.as_str() {
        "location" => Some(QueryKind::Location),
        "general" => Some(QueryKind::General),
        _ => None,
    }
}

const LOCATION_KEYWORDS: &[&str] = &[
    "donde",
    "dónde",
    "ubicacion",
    "ubicación",
    "distribuidor",
    "sucursal",
    "tienda",
    "venden",
    "where",
    "location",
    "store",
    "distributor",
    "near me",
];

fn keyword_fallback(text: &str) -> QueryKind {
    let lower = text.to_lowercase();
    if LOCATION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        QueryKind::Location
    } else {
        QueryKind::General
    }
}
