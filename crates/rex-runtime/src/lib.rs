//! `rex-runtime` – the agent's decision layer.
//!
//! # Modules
//!
//! - [`agent`] – [`Agent`][agent::Agent]: spawns the worker set and returns
//!   an [`AgentHandle`][agent::AgentHandle] for operator control.
//! - [`conversation`] – [`ConversationEngine`][conversation::ConversationEngine]:
//!   the conversation state machine. Pure: inputs in, effects out.
//! - [`behavior`] – [`BehaviorScheduler`][behavior::BehaviorScheduler]:
//!   autonomous idle walks, greetings and follow mode at the lowest action
//!   priority.
//! - [`cognition`] – [`CognitionService`][cognition::CognitionService] and the
//!   OpenAI-compatible [`LlmCognition`][cognition::LlmCognition] client
//!   (Ollama at `http://localhost:11434` by default). The
//!   [`CognitionReply`][rex_types::CognitionReply] JSON Schema is sent via
//!   `response_format` to keep replies typed.
//! - [`dispatcher`] – ordered, acknowledged command delivery with
//!   stop-preemption.
//! - [`speech`] – [`TextToSpeech`][speech::TextToSpeech] with cancellable
//!   playback.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with an optional OTLP span exporter.
//!
//! # Action gating
//!
//! Every motion command leaves the control task through
//! [`ActionGate::authorize`] or the dispatcher's stop path. [`ActionGate`]
//! is re-exported so callers need no direct dependency on `rex-kernel`.

pub mod agent;
pub mod behavior;
pub mod cognition;
pub mod conversation;
pub mod dispatcher;
pub mod speech;
pub mod telemetry;

pub use agent::{Agent, AgentConfig, AgentHandle, Collaborators, EmergencyStopper};
pub use behavior::{BehaviorConfig, BehaviorScheduler};
pub use cognition::{
    CognitionConfig, CognitionError, CognitionRequest, CognitionService, LlmCognition, ScriptedCognition,
};
pub use conversation::{ConversationConfig, ConversationEngine, ConversationState};
pub use dispatcher::{DispatcherConfig, DispatcherHandle};
pub use speech::{ConsoleVoice, SpeechOutcome, TextToSpeech};
pub use telemetry::{TracerProviderGuard, init_tracing};

pub use rex_kernel::ActionGate;
