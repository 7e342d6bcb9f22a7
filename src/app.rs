use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::future::join_all;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::prompting::{
    render_agent_note, render_handoff_notice, AgentNoteContext, HANDOFF_REQUEST_NOTE,
    SUMMARY_FALLBACK_TEXT,
};
use crate::types::*;

const EXCERPT_MAX_CHARS: usize = 220;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn excerpt(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() > EXCERPT_MAX_CHARS {
        let cut = normalized.chars().take(EXCERPT_MAX_CHARS).collect::<String>();
        format!("{cut}...")
    } else {
        normalized
    }
}

pub fn verify_webhook_signature(
    app_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    if app_secret.is_empty() {
        return false;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

pub fn verify_subscription(
    mode: &str,
    token: &str,
    challenge: &str,
    expected_token: &str,
) -> Option<String> {
    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected_token.is_empty()
        && token == expected_token
    {
        Some(challenge.to_string())
    } else {
        None
    }
}

pub struct HandoffLedger {
    active: RwLock<HashSet<String>>,
}

impl HandoffLedger {
    pub fn new() -> HandoffLedger {
        HandoffLedger {
            active: RwLock::new(HashSet::new()),
        }
    }

    pub async fn is_active(&self, conversation_id: &str) -> bool {
        self.active.read().await.contains(conversation_id)
    }

    // Monotonic: conversations only ever enter handoff. Returns true on the
    // first activation for this id.
    pub async fn activate(&self, conversation_id: &str) -> bool {
        self.active.write().await.insert(conversation_id.to_string())
    }
}

impl Default for HandoffLedger {
    fn default() -> HandoffLedger {
        HandoffLedger::new()
    }
}

pub struct HandoffIntent {
    pattern: Option<Regex>,
}

impl HandoffIntent {
    pub fn compile(keywords: &[String]) -> HandoffIntent {
        let escaped = keywords
            .iter()
            .map(|keyword| keyword.trim())
            .filter(|keyword| !keyword.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>();
        if escaped.is_empty() {
            // An empty keyword set must never match; an empty alternation
            // would match everything.
            return HandoffIntent { pattern: None };
        }
        HandoffIntent {
            pattern: Regex::new(&format!("(?i){}", escaped.join("|"))).ok(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern
            .as_ref()
            .map(|pattern| pattern.is_match(text))
            .unwrap_or(false)
    }
}

fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut map = HashMap::new();
    for contact in contacts {
        let wa_id = contact
            .get("wa_id")
            .and_then(Value::as_str)
            .or_else(|| contact.get("input").and_then(Value::as_str))
            .unwrap_or("");
        let Some(digits) = normalize_phone(wa_id) else {
            continue;
        };
        let name = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        map.insert(digits, name);
    }
    map
}

pub fn extract_messages(payload: &Value, expected_phone_number_id: &str) -> Vec<ParsedMessage> {
    let mut parsed = Vec::new();
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for change in changes {
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            let profile_names = contact_profile_names(&value);
            let metadata_phone_id = value
                .get("metadata")
                .and_then(|m| m.get("phone_number_id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if !expected_phone_number_id.is_empty()
                && !metadata_phone_id.is_empty()
                && expected_phone_number_id != metadata_phone_id
            {
                continue;
            }

            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for message in messages {
                let from = message
                    .get("from")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if from.is_empty() {
                    continue;
                }
                let kind = if message.get("type").and_then(Value::as_str) == Some("text") {
                    MessageKind::Text
                } else {
                    MessageKind::Other
                };
                let text = message
                    .get("text")
                    .and_then(|t| t.get("body"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let sender_name = normalize_phone(&from)
                    .and_then(|digits| profile_names.get(&digits).cloned())
                    .unwrap_or_default();
                parsed.push(ParsedMessage {
                    conversation_id: from,
                    kind,
                    text,
                    sender_name,
                });
            }
        }
    }

    parsed
}

fn first_text_body_mut(payload: &mut Value) -> Option<&mut Value> {
    let entries = payload.get_mut("entry")?.as_array_mut()?;
    let entry = entries.first_mut()?;
    let changes = entry.get_mut("changes")?.as_array_mut()?;
    for change in changes {
        let Some(messages) = change
            .get_mut("value")
            .and_then(|v| v.get_mut("messages"))
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        for message in messages {
            if message.get("type").and_then(Value::as_str) != Some("text") {
                continue;
            }
            return message.get_mut("text").and_then(|t| t.get_mut("body"));
        }
    }
    None
}

// Returns a derived copy with the agent note appended to the first text
// message; the input bytes are returned unchanged when there is nothing to
// annotate.
pub fn inject_agent_context(raw: &[u8], note: &str) -> Vec<u8> {
    let Ok(mut payload) = serde_json::from_slice::<Value>(raw) else {
        return raw.to_vec();
    };
    let Some(body) = first_text_body_mut(&mut payload) else {
        return raw.to_vec();
    };
    let Some(existing) = body.as_str() else {
        return raw.to_vec();
    };
    let amended = format!("{existing}\n\n{note}");
    *body = Value::String(amended);
    serde_json::to_vec(&payload).unwrap_or_else(|_| raw.to_vec())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    match verify_subscription(&mode, &token, &challenge, &state.config.verify_token) {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => StatusCode::FORBIDDEN.into_response(),
    }
}

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_webhook_signature(&state.config.app_secret, signature_header, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let event_id = Uuid::new_v4().to_string();
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let expected_phone_number_id = state
        .config
        .primary_sender
        .as_ref()
        .map(|sender| sender.phone_number_id.clone())
        .unwrap_or_default();
    let messages = extract_messages(&payload, &expected_phone_number_id);

    // The response below is the acknowledgment; fan-out and routing run
    // detached and can never delay or fail it.
    let fan_out_state = state.clone();
    let fan_out_raw = body.clone();
    let fan_out_id = event_id.clone();
    tokio::spawn(async move {
        fan_out_event(fan_out_state, &fan_out_id, fan_out_raw).await;
    });

    tokio::spawn(async move {
        route_messages(state, &event_id, body, messages).await;
    });

    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

async fn forward_raw(
    client: &reqwest::Client,
    target: &ForwardTarget,
    raw: Bytes,
) -> Result<u16, String> {
    let mut request = client
        .post(&target.url)
        .header("content-type", "application/json")
        .body(raw);
    for (name, value) in &target.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request
        .send()
        .await
        .map_err(|err| format!("request failed: {err}"))?;
    let status = response.status();
    if status.is_success() {
        return Ok(status.as_u16());
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("{status}: {}", excerpt(&body)))
}

async fn fan_out_event(state: Arc<AppState>, event_id: &str, raw: Bytes) {
    let targets = &state.config.observer_targets;
    if targets.is_empty() {
        return;
    }

    let results = join_all(
        targets
            .iter()
            .map(|target| forward_raw(&state.http, target, raw.clone())),
    )
    .await;

    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok(status) => {
                debug!(event_id = %event_id, url = %target.url, status, "fan-out delivered")
            }
            Err(err) => warn!(event_id = %event_id, url = %target.url, "fan-out failed: {err}"),
        }
    }
}

async fn route_messages(
    state: Arc<AppState>,
    event_id: &str,
    raw: Bytes,
    messages: Vec<ParsedMessage>,
) {
    for message in messages {
        if message.kind != MessageKind::Text {
            continue;
        }
        if message.conversation_id.is_empty() || message.text.trim().is_empty() {
            continue;
        }

        if state.handoff_intent.matches(&message.text) {
            run_handoff(&state, event_id, &raw, &message).await;
            continue;
        }

        if state.handoffs.is_active(&message.conversation_id).await {
            debug!(
                event_id = %event_id,
                conversation = %message.conversation_id,
                "conversation handed off; skipping ai reply"
            );
            continue;
        }

        let Some(ai_backend) = state.config.ai_backend.as_ref() else {
            continue;
        };
        match request_ai_reply(&state, ai_backend, &message).await {
            Ok(reply) if !reply.is_empty() => {
                let Some(sender) = state.config.primary_sender.as_ref() else {
                    debug!(
                        event_id = %event_id,
                        conversation = %message.conversation_id,
                        "no whatsapp sender configured; dropping ai reply"
                    );
                    continue;
                };
                if let Err(err) =
                    send_whatsapp_text(&state, sender, &message.conversation_id, &reply).await
                {
                    warn!(
                        event_id = %event_id,
                        conversation = %message.conversation_id,
                        "ai reply delivery failed: {err}"
                    );
                }
            }
            Ok(_) => debug!(
                event_id = %event_id,
                conversation = %message.conversation_id,
                "ai backend returned no reply"
            ),
            Err(err) => warn!(
                event_id = %event_id,
                conversation = %message.conversation_id,
                "ai backend unavailable: {err}"
            ),
        }
    }
}

async fn run_handoff(
    state: &Arc<AppState>,
    event_id: &str,
    raw: &Bytes,
    message: &ParsedMessage,
) {
    let newly_active = state.handoffs.activate(&message.conversation_id).await;
    info!(
        event_id = %event_id,
        conversation = %message.conversation_id,
        newly_active,
        "handoff requested"
    );

    if let Some(bridge) = state.config.agent_bridge.as_ref() {
        let note = render_agent_note(&AgentNoteContext {
            conversation_id: &message.conversation_id,
            sender_name: &message.sender_name,
            received_at: &now_iso(),
            summary: HANDOFF_REQUEST_NOTE,
        });
        let annotated = inject_agent_context(raw, &note);
        match forward_raw(&state.http, bridge, annotated.into()).await {
            Ok(status) => debug!(
                event_id = %event_id,
                conversation = %message.conversation_id,
                status,
                "agent bridge notified"
            ),
            Err(err) => warn!(
                event_id = %event_id,
                conversation = %message.conversation_id,
                "agent bridge forward failed: {err}"
            ),
        }
    }

    let Some(sender) = state
        .config
        .handoff_sender
        .as_ref()
        .or(state.config.primary_sender.as_ref())
    else {
        debug!(
            event_id = %event_id,
            conversation = %message.conversation_id,
            "no sender identity configured; skipping handoff messages"
        );
        return;
    };

    // Window-opening message: template when configured, free-form notice as
    // the fallback.
    let mut window_opened = false;
    if let Some(template) = state.config.handoff_template.as_ref() {
        match send_whatsapp_template(state, sender, &message.conversation_id, template).await {
            Ok(_) => window_opened = true,
            Err(err) => warn!(
                event_id = %event_id,
                conversation = %message.conversation_id,
                template = %template.name,
                "handoff template send failed: {err}"
            ),
        }
    }
    if !window_opened {
        let notice = render_handoff_notice(&message.sender_name);
        if let Err(err) =
            send_whatsapp_text(state, sender, &message.conversation_id, &notice).await
        {
            warn!(
                event_id = %event_id,
                conversation = %message.conversation_id,
                "handoff notice delivery failed: {err}"
            );
        }
    }

    if state.config.summary_backend_url.is_some() {
        let summary = match request_summary(state, &message.conversation_id).await {
            Ok(summary) if !summary.is_empty() => summary,
            Ok(_) => SUMMARY_FALLBACK_TEXT.to_string(),
            Err(err) => {
                warn!(
                    event_id = %event_id,
                    conversation = %message.conversation_id,
                    "summary backend unavailable: {err}"
                );
                SUMMARY_FALLBACK_TEXT.to_string()
            }
        };
        if let Err(err) =
            send_whatsapp_text(state, sender, &message.conversation_id, &summary).await
        {
            warn!(
                event_id = %event_id,
                conversation = %message.conversation_id,
                "summary delivery failed: {err}"
            );
        }
    }
}

async fn request_ai_reply(
    state: &Arc<AppState>,
    backend: &AiBackendConfig,
    message: &ParsedMessage,
) -> Result<String, String> {
    let mut request = state.http.post(&backend.url).json(&json!({
        "conversationId": message.conversation_id,
        "text": message.text,
    }));
    if let Some((user, password)) = backend.basic_auth.as_ref() {
        request = request.basic_auth(user, Some(password));
    }
    let response = request
        .send()
        .await
        .map_err(|err| format!("request failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("returned {status}: {}", excerpt(&body)));
    }
    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| format!("parse failed: {err}"))?;
    Ok(payload
        .get("reply")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string())
}

async fn request_summary(state: &Arc<AppState>, conversation_id: &str) -> Result<String, String> {
    let Some(url) = state.config.summary_backend_url.as_ref() else {
        return Ok(String::new());
    };
    let response = state
        .http
        .post(url)
        .json(&json!({ "conversationId": conversation_id }))
        .send()
        .await
        .map_err(|err| format!("request failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("returned {status}: {}", excerpt(&body)));
    }
    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| format!("parse failed: {err}"))?;
    Ok(payload
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string())
}

async fn post_graph_messages(
    state: &Arc<AppState>,
    sender: &SenderIdentity,
    payload: &Value,
) -> Result<Value, String> {
    let response = state
        .http
        .post(format!(
            "{}/{}/messages",
            state.config.graph_base_url, sender.phone_number_id
        ))
        .bearer_auth(&sender.access_token)
        .json(payload)
        .send()
        .await
        .map_err(|err| format!("request failed: {err}"))?;
    let status = response.status();
    let raw_body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(format!("{status}: {}", excerpt(&raw_body)));
    }
    Ok(serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body })))
}

async fn send_whatsapp_text(
    state: &Arc<AppState>,
    sender: &SenderIdentity,
    to: &str,
    text: &str,
) -> Result<Value, String> {
    let payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": text
        }
    });
    post_graph_messages(state, sender, &payload).await
}

async fn send_whatsapp_template(
    state: &Arc<AppState>,
    sender: &SenderIdentity,
    to: &str,
    template: &TemplateRef,
) -> Result<Value, String> {
    let payload = json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "template",
        "template": {
            "name": template.name,
            "language": { "code": template.language_code }
        }
    });
    post_graph_messages(state, sender, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn sample_event(text: &str) -> Vec<u8> {
        json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "contacts": [{
                            "wa_id": "15551234567",
                            "profile": { "name": "Ada" }
                        }],
                        "metadata": { "phone_number_id": "111222" },
                        "messages": [{
                            "type": "text",
                            "from": "15551234567",
                            "text": { "body": text }
                        }]
                    }
                }]
            }]
        })
        .to_string()
        .into_bytes()
    }

    fn keywords(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn signature_round_trip_verifies() {
        let body = br#"{"entry":[]}"#;
        let header = sign("app-secret", body);
        assert!(verify_webhook_signature("app-secret", Some(&header), body));
    }

    #[test]
    fn signature_rejects_mutated_body() {
        let body = br#"{"entry":[]}"#;
        let header = sign("app-secret", body);
        assert!(!verify_webhook_signature(
            "app-secret",
            Some(&header),
            br#"{"entry":[]} "#
        ));
    }

    #[test]
    fn signature_rejects_mutated_header() {
        let body = br#"{"entry":[]}"#;
        let mut header = sign("app-secret", body);
        let flipped = if header.ends_with('0') { "1" } else { "0" };
        header.truncate(header.len() - 1);
        header.push_str(flipped);
        assert!(!verify_webhook_signature("app-secret", Some(&header), body));
    }

    #[test]
    fn signature_rejects_missing_header_and_secret() {
        let body = br#"{"entry":[]}"#;
        let header = sign("app-secret", body);
        assert!(!verify_webhook_signature("app-secret", None, body));
        assert!(!verify_webhook_signature("app-secret", Some(""), body));
        assert!(!verify_webhook_signature("", Some(&header), body));
    }

    #[test]
    fn signature_rejects_malformed_hex() {
        let body = br#"{"entry":[]}"#;
        assert!(!verify_webhook_signature(
            "app-secret",
            Some("sha256=not-hex"),
            body
        ));
    }

    #[test]
    fn subscription_accepts_matching_token() {
        assert_eq!(
            verify_subscription("subscribe", "tok", "challenge-1", "tok"),
            Some("challenge-1".to_string())
        );
    }

    #[test]
    fn subscription_rejects_wrong_token_mode_or_empty_config() {
        assert_eq!(verify_subscription("subscribe", "bad", "c", "tok"), None);
        assert_eq!(verify_subscription("unsubscribe", "tok", "c", "tok"), None);
        assert_eq!(verify_subscription("subscribe", "", "c", ""), None);
        assert_eq!(verify_subscription("subscribe", "tok", "", "tok"), None);
    }

    #[test]
    fn intent_matches_default_terms_case_insensitively() {
        let intent = HandoffIntent::compile(&keywords(&["human", "live agent"]));
        assert!(intent.matches("I need a HUMAN"));
        assert!(intent.matches("please get me a Live Agent now"));
        assert!(!intent.matches("what are your opening hours"));
    }

    #[test]
    fn intent_with_empty_keyword_set_never_matches() {
        let intent = HandoffIntent::compile(&[]);
        assert!(!intent.matches("human"));
        assert!(!intent.matches(""));

        let intent = HandoffIntent::compile(&keywords(&["  ", ""]));
        assert!(!intent.matches("anything at all"));
    }

    #[test]
    fn intent_escapes_regex_metacharacters() {
        let intent = HandoffIntent::compile(&keywords(&["help+me?"]));
        assert!(intent.matches("can you help+me? thanks"));
        assert!(!intent.matches("helpme"));
    }

    #[tokio::test]
    async fn ledger_is_monotonic_and_idempotent() {
        let ledger = HandoffLedger::new();
        assert!(!ledger.is_active("15551234567").await);
        assert!(ledger.activate("15551234567").await);
        assert!(!ledger.activate("15551234567").await);
        assert!(ledger.is_active("15551234567").await);
        assert!(!ledger.is_active("15550000000").await);
    }

    #[test]
    fn extract_messages_reads_text_and_contact_name() {
        let payload: Value = serde_json::from_slice(&sample_event("hello")).unwrap();
        let messages = extract_messages(&payload, "");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].conversation_id, "15551234567");
        assert_eq!(messages[0].kind, MessageKind::Text);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[0].sender_name, "Ada");
    }

    #[test]
    fn extract_messages_skips_foreign_phone_number_id() {
        let payload: Value = serde_json::from_slice(&sample_event("hello")).unwrap();
        assert_eq!(extract_messages(&payload, "111222").len(), 1);
        assert!(extract_messages(&payload, "999999").is_empty());
    }

    #[test]
    fn extract_messages_degrades_to_empty_on_unexpected_shapes() {
        assert!(extract_messages(&json!({}), "").is_empty());
        assert!(extract_messages(&json!({ "entry": "nope" }), "").is_empty());
        assert!(extract_messages(&json!({ "entry": [{ "changes": [{}] }] }), "").is_empty());
    }

    #[test]
    fn extract_messages_marks_non_text_kinds() {
        let payload = json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "type": "image",
                            "from": "15551234567",
                            "image": { "id": "media-1" }
                        }]
                    }
                }]
            }]
        });
        let messages = extract_messages(&payload, "");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Other);
        assert!(messages[0].text.is_empty());
    }

    #[test]
    fn inject_appends_note_to_first_text_message() {
        let raw = sample_event("hello");
        let annotated = inject_agent_context(&raw, "--- note ---");
        assert_ne!(annotated, raw);

        let payload: Value = serde_json::from_slice(&annotated).unwrap();
        let body = payload["entry"][0]["changes"][0]["value"]["messages"][0]["text"]["body"]
            .as_str()
            .unwrap();
        assert!(body.starts_with("hello"));
        assert!(body.ends_with("--- note ---"));

        // The source bytes still parse to the original text.
        let original: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            original["entry"][0]["changes"][0]["value"]["messages"][0]["text"]["body"],
            json!("hello")
        );
    }

    #[test]
    fn inject_returns_input_unchanged_without_text_message() {
        let raw = json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{ "type": "image", "from": "1555", "image": {} }]
                    }
                }]
            }]
        })
        .to_string()
        .into_bytes();
        assert_eq!(inject_agent_context(&raw, "note"), raw);
    }

    #[test]
    fn inject_returns_input_unchanged_on_invalid_json() {
        let raw = b"not json at all".to_vec();
        assert_eq!(inject_agent_context(&raw, "note"), raw);
    }

    #[test]
    fn excerpt_is_single_line_and_bounded() {
        let long = "line one\nline two   spaced\n".repeat(40);
        let cut = excerpt(&long);
        assert!(!cut.contains('\n'));
        assert!(cut.chars().count() <= EXCERPT_MAX_CHARS + 3);
        assert!(cut.ends_with("..."));

        assert_eq!(excerpt("short  body"), "short body");
    }
}
