use std::str::FromStr;
use std::time::Duration;

use crate::backoff::RetryConfig;
use crate::services::completion_client::OPENAI_URL;

const GRAPH_API_URL: &str = "https://graph.facebook.com/v21.0";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_COMPANY: &str = "Chamoy la Avispa";
const DEFAULT_LOCATION_TEMPLATE: &str = "Hi {name}! Our products are sold through authorized distributors. \
Send us your city by direct message and we will point you to the closest one.";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Token echoed back during the webhook subscription handshake.
    pub verify_token: String,
    pub database_url: Option<String>,
    pub graph: GraphConfig,
    pub ai: AiConfig,
    pub identity: BotIdentity,
    pub retry: RetrySettings,
    /// Reply sent for distributor/location questions; `{name}` is replaced
    /// with the sender's name.
    pub location_template: String,
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    pub page_token: String,
    pub messenger_token: String,
    pub instagram_token: String,
    pub timeout: Duration,
    pub transport_retries: u32,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub base_url: String,
    pub reply_model: String,
    pub classifier_model: String,
    pub company_name: String,
}

/// The page's own account. Events authored by it are never answered.
#[derive(Debug, Clone, Default)]
pub struct BotIdentity {
    pub page_id: Option<String>,
    pub name: Option<String>,
}

impl BotIdentity {
    pub fn is_self(&self, actor_id: Option<&str>, actor_name: Option<&str>) -> bool {
        let id_matches = matches!(
            (self.page_id.as_deref(), actor_id),
            (Some(own), Some(actor)) if own == actor
        );
        let name_matches = matches!(
            (self.name.as_deref(), actor_name),
            (Some(own), Some(actor)) if own.eq_ignore_ascii_case(actor.trim())
        );
        id_matches || name_matches
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Period of the pending-message scan.
    pub interval: Duration,
    /// Per-record delay between attempts; zero retries on every tick.
    pub backoff: RetryConfig,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            backoff: RetryConfig::NO_DELAY,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| var(key).ok_or_else(|| anyhow::anyhow!("{key} not set"));

        let reply_model = var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let classifier_model = var("OPENAI_CLASSIFIER_MODEL").unwrap_or_else(|| reply_model.clone());

        let backoff_initial: u64 = parse_or(&var, "RETRY_BACKOFF_INITIAL_SECS", 0)?;
        let backoff_max: u64 = parse_or(&var, "RETRY_BACKOFF_MAX_SECS", 3600)?;

        Ok(Self {
            port: parse_or(&var, "PORT", 3000)?,
            verify_token: required("APP_TOKEN")?,
            database_url: var("DATABASE_URL"),
            graph: GraphConfig {
                base_url: var("GRAPH_API_BASE").unwrap_or_else(|| GRAPH_API_URL.to_string()),
                page_token: var("PAGE_ACCESS_TOKEN").unwrap_or_default(),
                messenger_token: required("APP_TOKEN_M")?,
                instagram_token: var("INSTAGRAM_ACCESS_TOKEN").unwrap_or_default(),
                timeout: Duration::from_secs(parse_or(&var, "DELIVERY_TIMEOUT_SECS", 15)?),
                transport_retries: parse_or(&var, "DELIVERY_TRANSPORT_RETRIES", 2)?,
            },
            ai: AiConfig {
                api_key: required("OPENAI_API_KEY")?,
                base_url: var("OPENAI_BASE_URL").unwrap_or_else(|| OPENAI_URL.to_string()),
                reply_model,
                classifier_model,
                company_name: var("COMPANY_NAME").unwrap_or_else(|| DEFAULT_COMPANY.to_string()),
            },
            identity: BotIdentity {
                page_id: var("BOT_PAGE_ID"),
                name: var("BOT_NAME"),
            },
            retry: RetrySettings {
                interval: Duration::from_secs(
                    parse_or::<u64, _>(&var, "RETRY_INTERVAL_SECS", 60)?.max(1),
                ),
                backoff: RetryConfig::new(
                    u32::MAX,
                    Duration::from_secs(backoff_initial),
                    Duration::from_secs(backoff_max),
                    2.0,
                ),
            },
            location_template: var("LOCATION_REPLY_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_LOCATION_TEMPLATE.to_string()),
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} `{raw}`: {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("APP_TOKEN", "verify-me"),
        ("APP_TOKEN_M", "messenger"),
        ("OPENAI_API_KEY", "sk-test"),
    ];

    #[test]
    fn applies_defaults() {
        let config = Config::from_lookup(lookup(REQUIRED)).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.verify_token, "verify-me");
        assert!(config.database_url.is_none());
        assert_eq!(config.graph.base_url, GRAPH_API_URL);
        assert_eq!(config.graph.transport_retries, 2);
        assert_eq!(config.ai.reply_model, DEFAULT_MODEL);
        assert_eq!(config.ai.classifier_model, DEFAULT_MODEL);
        assert_eq!(config.retry.interval, Duration::from_secs(60));
        assert_eq!(config.retry.backoff.delay_for_attempt(3), Duration::ZERO);
        assert!(config.location_template.contains("{name}"));
    }

    #[test]
    fn reads_overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://localhost/avispa"),
            ("OPENAI_MODEL", "ft:custom"),
            ("RETRY_INTERVAL_SECS", "3600"),
            ("RETRY_BACKOFF_INITIAL_SECS", "30"),
            ("BOT_NAME", "Chamoy la Avispa"),
            ("BOT_PAGE_ID", "999"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/avispa"));
        assert_eq!(config.ai.classifier_model, "ft:custom");
        assert_eq!(config.retry.interval, Duration::from_secs(3600));
        assert_eq!(config.retry.backoff.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(config.identity.page_id.as_deref(), Some("999"));
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let err = Config::from_lookup(lookup(&[("APP_TOKEN", "x")])).unwrap_err();
        assert!(err.to_string().contains("not set"));
    }

    #[test]
    fn invalid_number_is_an_error() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PORT", "eighty"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("invalid PORT"));
    }

    #[test]
    fn identity_matches_by_id_or_name() {
        let identity = BotIdentity {
            page_id: Some("999".to_string()),
            name: Some("Chamoy la Avispa".to_string()),
        };
        assert!(identity.is_self(Some("999"), None));
        assert!(identity.is_self(Some("1"), Some("chamoy la avispa")));
        assert!(!identity.is_self(Some("1"), Some("Ana")));
        assert!(!BotIdentity::default().is_self(Some("999"), Some("Ana")));
    }
}
