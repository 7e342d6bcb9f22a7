use std::{collections::HashMap, env, time::Duration};

use serde::Deserialize;
use serde_json::Value;

use crate::app::{HandoffIntent, HandoffLedger};

pub const DEFAULT_HANDOFF_KEYWORDS: &[&str] = &[
    "human",
    "real person",
    "representative",
    "live agent",
    "transfer",
    "handover",
    "talk to agent",
    "speak to agent",
    "speak with agent",
];

#[derive(Debug, Clone)]
pub struct SenderIdentity {
    pub access_token: String,
    pub phone_number_id: String,
}

#[derive(Debug, Clone)]
pub struct TemplateRef {
    pub name: String,
    pub language_code: String,
}

#[derive(Debug, Clone)]
pub struct AiBackendConfig {
    pub url: String,
    pub basic_auth: Option<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardTarget {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Other,
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub conversation_id: String,
    pub kind: MessageKind,
    pub text: String,
    pub sender_name: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub app_secret: String,
    pub verify_token: String,
    pub graph_base_url: String,
    pub primary_sender: Option<SenderIdentity>,
    pub handoff_sender: Option<SenderIdentity>,
    pub handoff_template: Option<TemplateRef>,
    pub ai_backend: Option<AiBackendConfig>,
    pub summary_backend_url: Option<String>,
    pub observer_targets: Vec<ForwardTarget>,
    pub agent_bridge: Option<ForwardTarget>,
    pub handoff_keywords: Vec<String>,
    pub http_timeout: Duration,
}

pub struct AppState {
    pub config: AppConfig,
    pub http: reqwest::Client,
    pub handoffs: HandoffLedger,
    pub handoff_intent: HandoffIntent,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<AppState> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let handoff_intent = HandoffIntent::compile(&config.handoff_keywords);
        Ok(AppState {
            config,
            http,
            handoffs: HandoffLedger::new(),
            handoff_intent,
        })
    }
}

fn env_text(key: &str) -> String {
    env::var(key).unwrap_or_default().trim().to_string()
}

fn env_opt(key: &str) -> Option<String> {
    let value = env_text(key);
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn sender_from_env(token_key: &str, phone_id_key: &str) -> Option<SenderIdentity> {
    let access_token = env_text(token_key);
    let phone_number_id = env_text(phone_id_key);
    if access_token.is_empty() || phone_number_id.is_empty() {
        return None;
    }
    Some(SenderIdentity {
        access_token,
        phone_number_id,
    })
}

pub fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

pub fn parse_forward_targets(raw: &str) -> Result<Vec<ForwardTarget>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed = serde_json::from_str::<Value>(raw)
        .map_err(|err| format!("FORWARD_TARGETS is not valid JSON: {err}"))?;
    let items = parsed
        .as_array()
        .ok_or_else(|| "FORWARD_TARGETS must be a JSON array".to_string())?;
    let mut targets = Vec::new();
    for item in items {
        let target = serde_json::from_value::<ForwardTarget>(item.clone())
            .map_err(|err| format!("invalid forward target entry: {err}"))?;
        if target.url.trim().is_empty() {
            continue;
        }
        targets.push(target);
    }
    Ok(targets)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<AppConfig> {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);

        let app_secret = env_text("WEBHOOK_APP_SECRET");
        if app_secret.is_empty() {
            anyhow::bail!("WEBHOOK_APP_SECRET is required");
        }
        let verify_token = env_text("WEBHOOK_VERIFY_TOKEN");
        if verify_token.is_empty() {
            anyhow::bail!("WEBHOOK_VERIFY_TOKEN is required");
        }

        let graph_base_url = env_opt("GRAPH_BASE_URL")
            .unwrap_or_else(|| "https://graph.facebook.com/v21.0".to_string())
            .trim_end_matches('/')
            .to_string();

        let primary_sender = sender_from_env("WHATSAPP_ACCESS_TOKEN", "WHATSAPP_PHONE_NUMBER_ID");
        let handoff_sender = sender_from_env("HANDOFF_ACCESS_TOKEN", "HANDOFF_PHONE_NUMBER_ID");

        let handoff_template = env_opt("HANDOFF_TEMPLATE_NAME").map(|name| TemplateRef {
            name,
            language_code: env_opt("HANDOFF_TEMPLATE_LANGUAGE")
                .unwrap_or_else(|| "en_US".to_string()),
        });

        let ai_backend = env_opt("AI_BACKEND_URL").map(|url| AiBackendConfig {
            url,
            basic_auth: match (env_opt("AI_BACKEND_USERNAME"), env_opt("AI_BACKEND_PASSWORD")) {
                (Some(user), Some(password)) => Some((user, password)),
                _ => None,
            },
        });

        let summary_backend_url = env_opt("SUMMARY_BACKEND_URL");

        let observer_targets =
            parse_forward_targets(&env_text("FORWARD_TARGETS")).map_err(|err| anyhow::anyhow!(err))?;

        let agent_bridge = env_opt("AGENT_BRIDGE_URL").map(|url| {
            let mut headers = HashMap::new();
            if let Some(token) = env_opt("AGENT_BRIDGE_TOKEN") {
                headers.insert("X-Auth-Token".to_string(), token);
            }
            ForwardTarget { url, headers }
        });

        let handoff_keywords = match env_opt("HANDOFF_KEYWORDS") {
            Some(raw) => split_keywords(&raw),
            None => DEFAULT_HANDOFF_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let http_timeout = Duration::from_secs(
            env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(15),
        );

        Ok(AppConfig {
            port,
            app_secret,
            verify_token,
            graph_base_url,
            primary_sender,
            handoff_sender,
            handoff_template,
            ai_backend,
            summary_backend_url,
            observer_targets,
            agent_bridge,
            handoff_keywords,
            http_timeout,
        })
    }
}
