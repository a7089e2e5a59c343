//! [`ConversationEngine`] – the conversation state machine.
//!
//! ```text
//!            wake              silence             reply            speech done
//!   Idle ──────────▶ Listening ───────▶ Thinking ───────▶ Speaking ─────────────▶ Idle
//!    ▲                    ▲                │ failure                 │
//!    │                    │                └──────▶ Idle (fallback)  │ wake (barge-in)
//!    │                    └─────────────────────────────────────────┘
//!    │ resume
//!  EmergencyStopped ◀── emergency phrase, safety stop or operator stop (from any state)
//! ```
//!
//! The engine is a pure transition function: [`ConversationEngine::handle`]
//! consumes one [`ConversationInput`] and returns the [`ConversationEffect`]s
//! the owning task must carry out (start a cognition request, speak, cancel
//! playback, stop the robot...). It never awaits, so an emergency phrase is
//! turned into a stop effect in the same call that receives it.
//!
//! Request and utterance ids make late results harmless: a cognition reply
//! or a playback completion that does not match the current state is
//! dropped.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rex_memory::{
    ConversationWindow, DEFAULT_IMPORTANCE, MemoryConfig, MemoryEntry, MemoryStore, Person, TurnRole,
};
use rex_perception::{SceneSnapshot, VisionEvent, WakeEvent};
use rex_types::{ActionIntent, CognitionReply, ConversationPhase, PersonId, RexError, RobotCommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cognition::CognitionRequest;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub robot_name: String,
    /// Names that are enrolled as owners.
    pub masters: Vec<String>,
    /// Give up listening when nothing was said for this long.
    pub listening_timeout_ms: u64,
    /// Forget the rolling context after this much silence.
    pub session_timeout_secs: i64,
    pub fallback_phrase: String,
    pub stop_phrase: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            robot_name: "Rex".to_string(),
            masters: Vec::new(),
            listening_timeout_ms: 8000,
            session_timeout_secs: 30,
            fallback_phrase: "Sorry, I didn't catch that.".to_string(),
            stop_phrase: "Stopping.".to_string(),
        }
    }
}

impl ConversationConfig {
    pub fn is_master(&self, name: &str) -> bool {
        self.masters.iter().any(|m| m.trim().eq_ignore_ascii_case(name.trim()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// States, inputs and effects
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationState {
    Idle,
    Listening {
        transcript: String,
        since: DateTime<Utc>,
    },
    Thinking {
        request_id: u64,
    },
    Speaking {
        utterance_id: u64,
    },
    EmergencyStopped {
        reason: String,
    },
}

impl ConversationState {
    pub fn phase(&self) -> ConversationPhase {
        match self {
            ConversationState::Idle => ConversationPhase::Idle,
            ConversationState::Listening { .. } => ConversationPhase::Listening,
            ConversationState::Thinking { .. } => ConversationPhase::Thinking,
            ConversationState::Speaking { .. } => ConversationPhase::Speaking,
            ConversationState::EmergencyStopped { .. } => ConversationPhase::EmergencyStopped,
        }
    }
}

/// Who asked for an emergency stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOrigin {
    /// "STOP Rex" was heard.
    Voice,
    /// The SafetyMonitor declared the link lost and already injected a stop.
    Safety,
    Operator,
}

#[derive(Debug, Clone)]
pub enum ConversationInput {
    Heard(WakeEvent),
    Vision(VisionEvent),
    CognitionSucceeded { request_id: u64, reply: CognitionReply },
    CognitionFailed { request_id: u64, error: RexError },
    SpeechFinished { utterance_id: u64 },
    SafetyStop { reason: String },
    OperatorStop,
    Resume,
    /// Periodic clock for timeouts.
    Tick,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEffect {
    PhaseChanged(ConversationPhase),
    /// Take the action channel for the conversation.
    AcquireChannel,
    ReleaseChannel,
    Heard(String),
    StartCognition { request_id: u64, request: CognitionRequest },
    CancelCognition,
    Speak { utterance_id: u64, text: String },
    CancelSpeech,
    /// Fire-and-forget utterance outside the turn structure.
    Announce(String),
    EmergencyStop { reason: String, origin: StopOrigin },
    Resumed,
    Command(RobotCommand),
    Follow { enabled: bool, target: Option<PersonId> },
    Thought(String),
    PersonEnrolled(Person),
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct ConversationEngine {
    config: ConversationConfig,
    memory: Arc<MemoryStore>,
    context_entries: usize,
    state: ConversationState,
    window: ConversationWindow,
    speaker: Option<Person>,
    stranger: Option<Vec<f32>>,
    scene: Option<SceneSnapshot>,
    /// Utterance started by a wake phrase heard while thinking.
    queued: Option<String>,
    /// User text of the in-flight exchange, for the memory log.
    exchange: Option<String>,
    end_session_after_turn: bool,
    next_id: u64,
}

impl ConversationEngine {
    pub fn new(config: ConversationConfig, memory: Arc<MemoryStore>, memory_config: &MemoryConfig) -> Self {
        Self {
            config,
            memory,
            context_entries: memory_config.context_entries,
            state: ConversationState::Idle,
            window: ConversationWindow::new(memory_config.window_turns),
            speaker: None,
            stranger: None,
            scene: None,
            queued: None,
            exchange: None,
            end_session_after_turn: false,
            next_id: 0,
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn phase(&self) -> ConversationPhase {
        self.state.phase()
    }

    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    pub fn speaker(&self) -> Option<&Person> {
        self.speaker.as_ref()
    }

    /// Apply one input observed at `now`.
    pub fn handle(&mut self, input: ConversationInput, now: DateTime<Utc>) -> Vec<ConversationEffect> {
        let before = self.state.phase();
        let mut effects = Vec::new();

        match input {
            ConversationInput::Heard(event) => self.on_heard(event, now, &mut effects),
            ConversationInput::Vision(event) => self.on_vision(event),
            ConversationInput::CognitionSucceeded { request_id, reply } => {
                if self.state == (ConversationState::Thinking { request_id }) {
                    self.on_reply(reply, now, &mut effects);
                } else {
                    debug!(request_id, "late cognition reply discarded");
                }
            }
            ConversationInput::CognitionFailed { request_id, error } => {
                if self.state == (ConversationState::Thinking { request_id }) {
                    warn!(request_id, error = %error, "cognition failed, using fallback");
                    self.exchange = None;
                    effects.push(ConversationEffect::Announce(self.config.fallback_phrase.clone()));
                    self.finish_turn(now, &mut effects);
                } else {
                    debug!(request_id, "late cognition failure discarded");
                }
            }
            ConversationInput::SpeechFinished { utterance_id } => {
                if self.state == (ConversationState::Speaking { utterance_id }) {
                    self.finish_turn(now, &mut effects);
                }
            }
            ConversationInput::SafetyStop { reason } => {
                self.enter_emergency(reason, StopOrigin::Safety, &mut effects)
            }
            ConversationInput::OperatorStop => {
                self.enter_emergency("operator stop".to_string(), StopOrigin::Operator, &mut effects)
            }
            ConversationInput::Resume => {
                if matches!(self.state, ConversationState::EmergencyStopped { .. }) {
                    self.state = ConversationState::Idle;
                    effects.push(ConversationEffect::Resumed);
                }
            }
            ConversationInput::Tick => self.on_tick(now),
        }

        let after = self.state.phase();
        if before != after {
            info!(from = ?before, to = ?after, "conversation state changed");
            let active = |p: ConversationPhase| {
                matches!(
                    p,
                    ConversationPhase::Listening | ConversationPhase::Thinking | ConversationPhase::Speaking
                )
            };
            if !active(before) && active(after) {
                effects.push(ConversationEffect::AcquireChannel);
            } else if active(before) && !active(after) {
                effects.push(ConversationEffect::ReleaseChannel);
            }
            effects.push(ConversationEffect::PhaseChanged(after));
        }
        effects
    }

    fn on_heard(&mut self, event: WakeEvent, now: DateTime<Utc>, effects: &mut Vec<ConversationEffect>) {
        match event {
            WakeEvent::EmergencyPhrase { text } => {
                self.enter_emergency(format!("heard \"{text}\""), StopOrigin::Voice, effects)
            }
            WakeEvent::Wake { confidence } => match &self.state {
                ConversationState::Idle => {
                    debug!(confidence, "wake phrase");
                    self.start_listening(String::new(), now);
                }
                ConversationState::Speaking { .. } => {
                    info!("barge-in, cutting playback");
                    effects.push(ConversationEffect::CancelSpeech);
                    self.start_listening(String::new(), now);
                }
                ConversationState::Thinking { .. } => {
                    debug!("wake while thinking, queued as next utterance");
                    self.queued.get_or_insert_with(String::new);
                }
                ConversationState::Listening { .. } | ConversationState::EmergencyStopped { .. } => {}
            },
            WakeEvent::FinalTranscript(text) => {
                let target = match &mut self.state {
                    ConversationState::Listening { transcript, .. } => Some(transcript),
                    ConversationState::Thinking { .. } => self.queued.as_mut(),
                    _ => None,
                };
                if let Some(buffer) = target {
                    if !buffer.is_empty() {
                        buffer.push(' ');
                    }
                    buffer.push_str(text.trim());
                    effects.push(ConversationEffect::Heard(text));
                }
            }
            WakeEvent::PartialTranscript(_) => {}
            WakeEvent::Silence(quiet) => {
                if let ConversationState::Listening { transcript, .. } = &self.state {
                    if !transcript.trim().is_empty() {
                        debug!(?quiet, "end of utterance");
                        let request = strip_wake_phrase(transcript, &self.config.robot_name);
                        if request.is_empty() {
                            debug!("only the wake phrase was said, waiting for the request");
                            self.start_listening(String::new(), now);
                        } else {
                            self.begin_thinking(request, now, effects);
                        }
                    }
                }
            }
        }
    }

    fn on_vision(&mut self, event: VisionEvent) {
        match event {
            VisionEvent::PersonRecognized { person, .. } => self.speaker = Some(person),
            VisionEvent::UnknownPersonSeen { fingerprint } => self.stranger = Some(fingerprint),
            VisionEvent::SceneDescription(scene) => self.scene = Some(scene),
        }
    }

    fn on_tick(&mut self, now: DateTime<Utc>) {
        match &self.state {
            ConversationState::Listening { transcript, since }
                if transcript.is_empty()
                    && now - *since >= Duration::milliseconds(self.config.listening_timeout_ms as i64) =>
            {
                info!("nothing heard, stop listening");
                self.state = ConversationState::Idle;
            }
            ConversationState::Idle
                if !self.window.is_empty()
                    && self
                        .window
                        .is_stale(now, Duration::seconds(self.config.session_timeout_secs)) =>
            {
                self.reset_session();
            }
            _ => {}
        }
    }

    fn on_reply(&mut self, reply: CognitionReply, now: DateTime<Utc>, effects: &mut Vec<ConversationEffect>) {
        let speech = reply.speech.trim().to_string();
        if !speech.is_empty() {
            self.window.push(TurnRole::Robot, speech.as_str(), now);
        }
        if let Some(user) = self.exchange.take() {
            self.remember_exchange(&user, &speech);
        }
        if let Some(thought) = reply.internal_thought.filter(|t| !t.is_empty()) {
            effects.push(ConversationEffect::Thought(thought));
        }
        if let Some(action) = reply.action {
            self.apply_action(action, now, effects);
        }
        if reply.end_conversation {
            self.end_session_after_turn = true;
        }

        if speech.is_empty() {
            self.finish_turn(now, effects);
        } else {
            let utterance_id = self.next_id();
            self.state = ConversationState::Speaking { utterance_id };
            effects.push(ConversationEffect::Speak {
                utterance_id,
                text: speech,
            });
        }
    }

    fn apply_action(&mut self, action: ActionIntent, now: DateTime<Utc>, effects: &mut Vec<ConversationEffect>) {
        let speaker_id = self.speaker.as_ref().map(|p| p.id);
        match action {
            ActionIntent::RememberPerson { name } => match self.stranger.take() {
                Some(fingerprint) => {
                    let is_master = self.config.is_master(&name);
                    match self.memory.enroll_person(&name, fingerprint, is_master, now) {
                        Ok(person) => {
                            self.speaker = Some(person.clone());
                            effects.push(ConversationEffect::PersonEnrolled(person));
                        }
                        Err(e) => warn!(name = %name, error = %e, "enrollment failed"),
                    }
                }
                None => warn!(name = %name, "asked to remember someone but no unknown face is in view"),
            },
            ActionIntent::Sleep => self.end_session_after_turn = true,
            ActionIntent::Follow { enabled } => effects.push(ConversationEffect::Follow {
                enabled,
                target: if enabled { speaker_id } else { None },
            }),
            other => {
                if let Some(command) = other.to_command(speaker_id) {
                    effects.push(ConversationEffect::Command(command));
                }
            }
        }
    }

    fn remember_exchange(&self, user: &str, speech: &str) {
        let who = self.speaker.as_ref().map_or("Someone", |p| p.name.as_str());
        let summary = if speech.is_empty() {
            format!("{who} said \"{user}\"")
        } else {
            format!("{who} said \"{user}\" and I answered \"{speech}\"")
        };
        let entry = MemoryEntry::new(self.speaker.as_ref().map(|p| p.id), summary, DEFAULT_IMPORTANCE);
        if let Err(e) = self.memory.append(&entry) {
            warn!(error = %e, "failed to record conversation memory");
        }
    }

    fn start_listening(&mut self, transcript: String, now: DateTime<Utc>) {
        self.state = ConversationState::Listening {
            transcript,
            since: now,
        };
    }

    fn begin_thinking(&mut self, transcript: String, now: DateTime<Utc>, effects: &mut Vec<ConversationEffect>) {
        let memories = match &self.speaker {
            Some(p) => self.memory.memories_about(p.id, self.context_entries),
            None => self.memory.recent(self.context_entries),
        };
        let request = CognitionRequest {
            transcript: transcript.clone(),
            history: self.window.turns(),
            memories,
            speaker: self.speaker.clone(),
            scene: self.scene.clone(),
            stranger_in_view: self.stranger.is_some(),
        };
        self.window.push(TurnRole::User, transcript.as_str(), now);
        self.exchange = Some(transcript);

        let request_id = self.next_id();
        self.state = ConversationState::Thinking { request_id };
        effects.push(ConversationEffect::StartCognition { request_id, request });
    }

    /// Leave Thinking/Speaking: either pick up the queued utterance or go
    /// back to Idle.
    fn finish_turn(&mut self, now: DateTime<Utc>, effects: &mut Vec<ConversationEffect>) {
        if std::mem::take(&mut self.end_session_after_turn) {
            self.reset_session();
        }
        let next = self
            .queued
            .take()
            .map(|text| strip_wake_phrase(&text, &self.config.robot_name));
        match next {
            Some(next) if !next.is_empty() => self.begin_thinking(next, now, effects),
            Some(_) => self.start_listening(String::new(), now),
            None => self.state = ConversationState::Idle,
        }
    }

    fn enter_emergency(&mut self, reason: String, origin: StopOrigin, effects: &mut Vec<ConversationEffect>) {
        match &self.state {
            ConversationState::EmergencyStopped { .. } => {
                debug!(reason = %reason, "already emergency stopped");
                return;
            }
            ConversationState::Thinking { .. } => effects.push(ConversationEffect::CancelCognition),
            ConversationState::Speaking { .. } => effects.push(ConversationEffect::CancelSpeech),
            _ => {}
        }
        warn!(reason = %reason, ?origin, "emergency stop");
        self.queued = None;
        self.exchange = None;
        self.end_session_after_turn = false;
        effects.push(ConversationEffect::EmergencyStop {
            reason: reason.clone(),
            origin,
        });
        effects.push(ConversationEffect::Announce(self.config.stop_phrase.clone()));
        self.state = ConversationState::EmergencyStopped { reason };
    }

    fn reset_session(&mut self) {
        info!(turns = self.window.len(), "conversation session reset");
        self.window.reset();
        self.speaker = None;
        self.stranger = None;
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn is_word(token: &str, word: &str) -> bool {
    words(token).concat() == word
}

/// Drop the robot's name (with an optional "hey"/"ok" in front) from the
/// start of `text`, and a trailing name. "Hey Rex, sit down" becomes
/// "sit down"; "Rex" alone becomes empty.
fn strip_wake_phrase(text: &str, robot_name: &str) -> String {
    let name = words(robot_name);
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let matches_name = |at: usize| {
        name.len() <= tokens.len().saturating_sub(at)
            && !name.is_empty()
            && name.iter().enumerate().all(|(i, w)| is_word(tokens[at + i], w))
    };

    let mut start = 0;
    while start < tokens.len() && ["hey", "hi", "ok", "okay"].iter().any(|f| is_word(tokens[start], f)) {
        start += 1;
    }
    if matches_name(start) {
        start += name.len();
    } else {
        start = 0;
    }
    let mut end = tokens.len();
    if end >= start + name.len() && matches_name(end - name.len()) {
        end -= name.len();
    }

    tokens[start..end.max(start)]
        .join(" ")
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | ':' | '-'))
        .to_string()
}
