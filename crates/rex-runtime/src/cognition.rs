//! [`LlmCognition`] – the conversational brain behind an OpenAI-compatible
//! chat endpoint.
//!
//! The ConversationEngine hands over a [`CognitionRequest`] (the current
//! transcript plus its context) and gets back a [`CognitionReply`]: the text
//! to speak and at most one structured [`ActionIntent`]. Free text is never
//! parsed for commands; the model must put them in the `action` field, whose
//! JSON schema is embedded in the system prompt and in `response_format`.
//!
//! # Failure model
//!
//! | Situation                          | Outcome                                   |
//! |------------------------------------|-------------------------------------------|
//! | HTTP 429 / 529 (overloaded)        | retried, backoff `retry_base_ms · 2ⁿ`     |
//! | other HTTP error, transport error  | `RexError::Service { service: "cognition" }` |
//! | overall budget `timeout_ms` spent  | `RexError::Timeout`                       |
//! | body is not the reply JSON         | whole text becomes `speech`               |
//!
//! Every failure is recoverable: the engine answers with its fallback phrase.
//!
//! # Example
//!
//! ```rust,no_run
//! use rex_runtime::cognition::{CognitionConfig, CognitionRequest, CognitionService, LlmCognition};
//!
//! # async fn demo() -> Result<(), rex_types::RexError> {
//! let brain = LlmCognition::new(CognitionConfig::default(), "Rex", &["Alice".to_string()])?;
//! let reply = brain.respond(&CognitionRequest::new("Rex, sit down!")).await?;
//! println!("{}", reply.speech);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rex_memory::{ConversationTurn, MemoryEntry, Person, TurnRole};
use rex_perception::SceneSnapshot;
use rex_types::{CognitionReply, RexError};
use reqwest::StatusCode;
use schemars::schema_for;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CognitionError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Still overloaded after the last retry.
    #[error("Service overloaded (HTTP {0}) after {1} attempts")]
    Overloaded(u16, u32),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<CognitionError> for RexError {
    fn from(e: CognitionError) -> Self {
        RexError::service("cognition", e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CognitionConfig {
    /// Base URL of the model server, without the `/v1/...` suffix.
    pub base_url: String,
    pub model: String,
    /// Bearer token; empty for local servers.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    /// Budget for one request including retries.
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    /// Personality paragraph placed at the top of the system prompt.
    pub persona: String,
}

impl Default for CognitionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            api_key: String::new(),
            timeout_ms: 20_000,
            max_attempts: 3,
            retry_base_ms: 1000,
            persona: "You are a friendly, curious robot dog. You keep answers short \
                      because they are spoken aloud."
                .to_string(),
        }
    }
}

impl std::fmt::Debug for CognitionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CognitionConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("timeout_ms", &self.timeout_ms)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_ms", &self.retry_base_ms)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the brain gets to see for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CognitionRequest {
    pub transcript: String,
    /// Earlier turns of this session, oldest first.
    pub history: Vec<ConversationTurn>,
    pub memories: Vec<MemoryEntry>,
    /// Who is most likely talking.
    pub speaker: Option<Person>,
    pub scene: Option<SceneSnapshot>,
    /// An unenrolled face is in view and could be remembered.
    pub stranger_in_view: bool,
}

impl CognitionRequest {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            ..Self::default()
        }
    }
}

/// The cognition collaborator. Must fail with a distinct error, never
/// with a made-up reply.
#[async_trait]
pub trait CognitionService: Send + Sync {
    async fn respond(&self, request: &CognitionRequest) -> Result<CognitionReply, RexError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    response_format: &'a ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmCognition
// ─────────────────────────────────────────────────────────────────────────────

pub struct LlmCognition {
    config: CognitionConfig,
    system_prompt: String,
    response_format: ResponseFormat,
    client: reqwest::Client,
}

impl LlmCognition {
    /// # Errors
    ///
    /// [`RexError::Config`] if the HTTP client cannot be built.
    pub fn new(config: CognitionConfig, robot_name: &str, masters: &[String]) -> Result<Self, RexError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RexError::Config(format!("cognition client: {e}")))?;
        let schema = serde_json::to_value(schema_for!(CognitionReply)).unwrap_or(serde_json::Value::Null);
        Ok(Self {
            system_prompt: system_prompt(&config.persona, robot_name, masters, &schema),
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: schema,
            },
            config,
            client,
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Assemble the chat transcript for one request.
    pub fn build_messages(&self, request: &CognitionRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new(Role::System, self.system_prompt.as_str())];
        if let Some(context) = context_block(request) {
            messages.push(ChatMessage::new(Role::System, context));
        }
        messages.extend(request.history.iter().map(|turn| {
            let role = match turn.role {
                TurnRole::User => Role::User,
                TurnRole::Robot => Role::Assistant,
            };
            ChatMessage::new(role, turn.text.as_str())
        }));
        messages.push(ChatMessage::new(Role::User, request.transcript.as_str()));
        messages
    }

    /// POST `messages`, retrying while the server reports overload.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CognitionError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            stream: false,
            response_format: &self.response_format,
        };
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut post = self.client.post(&url).json(&body);
            if !self.config.api_key.is_empty() {
                post = post.bearer_auth(&self.config.api_key);
            }
            let response = post.send().await?;
            let status = response.status();
            if is_overloaded(status) {
                if attempt >= attempts {
                    return Err(CognitionError::Overloaded(status.as_u16(), attempt));
                }
                let backoff = backoff(self.config.retry_base_ms, attempt);
                warn!(status = status.as_u16(), attempt, ?backoff, "cognition overloaded, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }
            let response: ChatResponse = response.error_for_status()?.json().await?;
            return response
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| CognitionError::BadResponse("empty choices array".into()));
        }
    }
}

#[async_trait]
impl CognitionService for LlmCognition {
    async fn respond(&self, request: &CognitionRequest) -> Result<CognitionReply, RexError> {
        let messages = self.build_messages(request);
        let budget = Duration::from_millis(self.config.timeout_ms);
        let content = tokio::time::timeout(budget, self.complete(&messages))
            .await
            .map_err(|_| RexError::Timeout(format!("cognition gave no reply within {budget:?}")))??;
        debug!(chars = content.len(), "cognition replied");
        Ok(parse_reply(&content))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompt and reply helpers
// ─────────────────────────────────────────────────────────────────────────────

fn is_overloaded(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 529
}

/// Delay before retry number `attempt` (1-based): `base`, `2·base`, `4·base`...
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

fn system_prompt(persona: &str, robot_name: &str, masters: &[String], schema: &serde_json::Value) -> String {
    let owners = if masters.is_empty() {
        "You have no registered owners yet.".to_string()
    } else {
        format!("Your owners are: {}.", masters.join(", "))
    };
    format!(
        "Your name is {robot_name}. {persona}\n{owners}\n\n\
         ## Reply format\n\
         Always answer with a single JSON object matching this schema and nothing else:\n\
         {schema}\n\
         - `speech` is what you say out loud; keep it to one or two sentences.\n\
         - `action` is optional and holds at most one physical action. Never describe an \
         action in speech without also putting it in `action`.\n\
         - To remember a new person's name when a stranger is in view, use the \
         `remember_person` action.\n\
         - Set `end_conversation` to true when the person says goodbye."
    )
}

fn context_block(request: &CognitionRequest) -> Option<String> {
    let mut lines = Vec::new();
    match &request.speaker {
        Some(p) if p.is_master => lines.push(format!("You are talking to {}, one of your owners.", p.name)),
        Some(p) => lines.push(format!("You are talking to {}.", p.name)),
        None => {}
    }
    if request.stranger_in_view {
        lines.push("Someone you do not know yet is in front of you.".to_string());
    }
    if let Some(scene) = &request.scene {
        lines.push(format!("You currently see: {}", scene.description));
    }
    if !request.memories.is_empty() {
        lines.push("Things you remember:".to_string());
        lines.extend(
            request
                .memories
                .iter()
                .map(|m| format!("- [{}] {}", m.timestamp.format("%Y-%m-%d"), m.summary)),
        );
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Spoken when the model answered with JSON too broken to salvage.
pub const UNREADABLE_REPLY: &str = "Sorry, my thoughts got jumbled. Could you say that again?";

/// Decode the model's answer. Prose that is not the reply JSON, even after
/// trimming code fences or surrounding text, is spoken as-is. Broken JSON is
/// never spoken: the `speech` value is salvaged when present.
pub fn parse_reply(content: &str) -> CognitionReply {
    let trimmed = content.trim();
    if let Ok(reply) = serde_json::from_str::<CognitionReply>(trimmed) {
        return reply;
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(reply) = serde_json::from_str::<CognitionReply>(&trimmed[start..=end]) {
                return reply;
            }
        }
    }
    if let Some(speech) = salvage_speech(trimmed) {
        warn!("cognition reply was malformed JSON, speech salvaged");
        return CognitionReply::speech_only(speech);
    }
    if looks_like_json(trimmed) {
        warn!("cognition reply was unreadable JSON");
        return CognitionReply::speech_only(UNREADABLE_REPLY);
    }
    debug!("cognition reply was not JSON, speaking it verbatim");
    CognitionReply::speech_only(trimmed)
}

fn looks_like_json(text: &str) -> bool {
    let body = text.trim_start_matches("```json").trim_start_matches("```").trim_start();
    body.starts_with('{') || body.starts_with('[')
}

/// Pull the `"speech": "..."` value out of truncated or otherwise invalid
/// JSON. The value runs to its closing quote or to the end of the text.
fn salvage_speech(text: &str) -> Option<String> {
    let key = text.find("\"speech\"")?;
    let rest = text[key + "\"speech\"".len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;

    let mut raw = String::new();
    let mut escaped = false;
    for c in rest.chars() {
        match c {
            '"' if !escaped => break,
            '\\' if !escaped => escaped = true,
            _ => escaped = false,
        }
        raw.push(c);
    }
    if escaped {
        // Cut off in the middle of an escape sequence.
        raw.pop();
    }

    let speech = serde_json::from_str::<String>(&format!("\"{raw}\""))
        .unwrap_or_else(|_| raw.replace("\\\"", "\"").replace("\\n", " "));
    let speech = speech.trim().to_string();
    (!speech.is_empty()).then_some(speech)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted cognition
// ─────────────────────────────────────────────────────────────────────────────

/// Replays canned outcomes in order, then echoes. Used by tests and the
/// offline CLI mode.
#[derive(Default)]
pub struct ScriptedCognition {
    script: Mutex<VecDeque<Result<CognitionReply, RexError>>>,
    seen: Mutex<Vec<CognitionRequest>>,
    delay: Duration,
}

impl ScriptedCognition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reply resolves only after `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push(&self, outcome: Result<CognitionReply, RexError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CognitionRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CognitionService for ScriptedCognition {
    async fn respond(&self, request: &CognitionRequest) -> Result<CognitionReply, RexError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Ok(CognitionReply::speech_only(format!("You said: {}", request.transcript))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rex_types::{ActionIntent, MotionMode};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn brain(base_url: &str) -> LlmCognition {
        LlmCognition::new(
            CognitionConfig {
                base_url: base_url.to_string(),
                retry_base_ms: 10,
                timeout_ms: 5000,
                ..CognitionConfig::default()
            },
            "Rex",
            &["Alice".to_string()],
        )
        .unwrap()
    }

    /// Minimal HTTP server: answers the n-th connection with `responses[n]`
    /// (status, body), repeating the last one.
    async fn fake_server(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses[n.min(responses.len() - 1)].clone();
                let mut buf = vec![0u8; 16 * 1024];
                let _ = stream.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn completion(content: &str) -> String {
        serde_json::json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
            .to_string()
    }

    #[test]
    fn chat_message_serializes_role() {
        let msg = ChatMessage::new(Role::Assistant, "hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"assistant\""));
    }

    #[test]
    fn system_prompt_embeds_reply_schema_and_owners() {
        let b = brain("http://localhost:1");
        let prompt = b.system_prompt();
        assert!(prompt.contains("Your name is Rex"));
        assert!(prompt.contains("Alice"));
        assert!(prompt.contains("end_conversation"));
        assert!(prompt.contains("remember_person"));
    }

    #[test]
    fn messages_carry_context_history_and_transcript() {
        let b = brain("http://localhost:1");
        let now = Utc::now();
        let request = CognitionRequest {
            transcript: "what did I tell you?".into(),
            history: vec![
                ConversationTurn {
                    role: TurnRole::User,
                    text: "my cat is Tom".into(),
                    timestamp: now,
                },
                ConversationTurn {
                    role: TurnRole::Robot,
                    text: "Nice!".into(),
                    timestamp: now,
                },
            ],
            memories: vec![MemoryEntry::new(None, "Alice likes tennis", 5.0)],
            speaker: Some(Person::new("Alice", vec![1.0], true, now)),
            scene: Some(SceneSnapshot {
                description: "a sunny kitchen".into(),
                captured_at: now,
            }),
            stranger_in_view: false,
        };
        let messages = b.build_messages(&request);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[1].role, Role::System);
        assert!(messages[1].content.contains("Alice, one of your owners"));
        assert!(messages[1].content.contains("sunny kitchen"));
        assert!(messages[1].content.contains("likes tennis"));
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[3].role, Role::Assistant);
        assert_eq!(messages[4].content, "what did I tell you?");
    }

    #[test]
    fn bare_request_has_no_context_message() {
        let b = brain("http://localhost:1");
        let messages = b.build_messages(&CognitionRequest::new("hi"));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn parse_reply_accepts_json_and_fenced_json() {
        let reply = parse_reply(r#"{"speech":"Sport mode on","action":{"type":"set_mode","mode":"sport"}}"#);
        assert_eq!(reply.action, Some(ActionIntent::SetMode { mode: MotionMode::Sport }));

        let fenced = parse_reply("```json\n{\"speech\":\"Woof\",\"end_conversation\":true}\n```");
        assert_eq!(fenced.speech, "Woof");
        assert!(fenced.end_conversation);
    }

    #[test]
    fn parse_reply_speaks_plain_text() {
        let reply = parse_reply("  Sure, I can do that!  ");
        assert_eq!(reply, CognitionReply::speech_only("Sure, I can do that!"));
    }

    #[test]
    fn parse_reply_salvages_speech_from_truncated_json() {
        let reply = parse_reply(r#"{"speech":"Hello there, I am Rex and"#);
        assert_eq!(reply, CognitionReply::speech_only("Hello there, I am Rex and"));

        let escaped = parse_reply(r#"{"speech": "She said \"sit\" so I sat.", "action": {"type":"#);
        assert_eq!(escaped.speech, r#"She said "sit" so I sat."#);

        let mid_escape = parse_reply(r#"{"speech":"Line one\"#);
        assert_eq!(mid_escape.speech, "Line one");
    }

    #[test]
    fn parse_reply_apologizes_for_unreadable_json() {
        let reply = parse_reply(r#"{"action": {"type": "sit""#);
        assert_eq!(reply.speech, UNREADABLE_REPLY);
        assert!(reply.action.is_none());

        let fenced = parse_reply("```json\n{\"end_conversation\": tr");
        assert_eq!(fenced.speech, UNREADABLE_REPLY);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff(1000, 1), Duration::from_secs(1));
        assert_eq!(backoff(1000, 2), Duration::from_secs(2));
        assert_eq!(backoff(1000, 3), Duration::from_secs(4));
    }

    #[test]
    fn debug_redacts_api_key() {
        let cfg = CognitionConfig {
            api_key: "sk-secret".into(),
            ..CognitionConfig::default()
        };
        let s = format!("{cfg:?}");
        assert!(!s.contains("sk-secret"));
        assert!(s.contains("<redacted>"));
    }

    #[tokio::test]
    async fn overloaded_responses_are_retried() {
        let ok = completion(r#"{"speech":"Hello!"}"#);
        let (url, hits) = fake_server(vec![(529, "{}".into()), (429, "{}".into()), (200, ok)]).await;
        let reply = brain(&url).respond(&CognitionRequest::new("hi")).await.unwrap();
        assert_eq!(reply.speech, "Hello!");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (url, hits) = fake_server(vec![(529, "{}".into())]).await;
        let err = brain(&url).respond(&CognitionRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, RexError::Service { ref service, .. } if service == "cognition"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn server_error_is_a_distinct_failure() {
        let (url, hits) = fake_server(vec![(500, "{}".into())]).await;
        assert!(brain(&url).respond(&CognitionRequest::new("hi")).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scripted_cognition_replays_then_echoes() {
        let s = ScriptedCognition::new();
        s.push(Err(RexError::Timeout("slow".into())));
        assert!(s.respond(&CognitionRequest::new("one")).await.is_err());
        let reply = s.respond(&CognitionRequest::new("two")).await.unwrap();
        assert_eq!(reply.speech, "You said: two");
        assert_eq!(s.requests().len(), 2);
    }
}
