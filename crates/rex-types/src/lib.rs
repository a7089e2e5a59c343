use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Walking speed used when a cognition intent does not name one.
pub const DEFAULT_WALK_SPEED: f32 = 0.3;
/// Yaw rate used for `Turn` intents.
pub const DEFAULT_TURN_RATE: f32 = 0.5;

/// Stable identifier of a person record in the memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(pub Uuid);

impl PersonId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PersonId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Motion vocabulary
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
}

/// Gait profile of the robot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MotionMode {
    #[default]
    Normal,
    Sport,
    Stairs,
}

/// Named postures and tricks the robot firmware knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    Stand,
    Sit,
    LieDown,
    ShakePaw,
    Wave,
    Dance,
    Stretch,
    Heart,
}

/// High-level named command sent over the robot motion link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum RobotCommand {
    /// Halt all motion immediately.
    Stop,
    Gesture(Gesture),
    /// Walk in `direction` at `speed` (fraction of the configured maximum).
    Walk { direction: Direction, speed: f32 },
    /// Rotate in place by `degrees` at yaw `rate`.
    Turn { degrees: f32, rate: f32 },
    Follow {
        enabled: bool,
        target: Option<PersonId>,
    },
    SetMode(MotionMode),
}

impl RobotCommand {
    pub fn is_stop(&self) -> bool {
        matches!(self, RobotCommand::Stop)
    }

    /// Short name used in logs and interlock messages.
    pub fn name(&self) -> &'static str {
        match self {
            RobotCommand::Stop => "stop",
            RobotCommand::Gesture(_) => "gesture",
            RobotCommand::Walk { .. } => "walk",
            RobotCommand::Turn { .. } => "turn",
            RobotCommand::Follow { .. } => "follow",
            RobotCommand::SetMode(_) => "set_mode",
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Cognition contract
// ────────────────────────────────────────────────────────────────────────────

/// Structured action the cognition service may attach to a reply.
///
/// This is the only path by which spoken requests ("follow me", "sport
/// mode") become robot commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionIntent {
    Stop,
    Gesture { gesture: Gesture },
    Walk { direction: Direction },
    Turn { degrees: f32 },
    Follow { enabled: bool },
    SetMode { mode: MotionMode },
    /// Enroll the most recent unknown face under `name`.
    RememberPerson { name: String },
    /// End the conversation session and forget the rolling context.
    Sleep,
}

impl ActionIntent {
    /// Translate into a link command. `speaker` becomes the follow target.
    ///
    /// Returns `None` for intents that do not move the robot.
    pub fn to_command(&self, speaker: Option<PersonId>) -> Option<RobotCommand> {
        match self {
            ActionIntent::Stop => Some(RobotCommand::Stop),
            ActionIntent::Gesture { gesture } => Some(RobotCommand::Gesture(*gesture)),
            ActionIntent::Walk { direction } => Some(RobotCommand::Walk {
                direction: *direction,
                speed: DEFAULT_WALK_SPEED,
            }),
            ActionIntent::Turn { degrees } => Some(RobotCommand::Turn {
                degrees: *degrees,
                rate: DEFAULT_TURN_RATE,
            }),
            ActionIntent::Follow { enabled } => Some(RobotCommand::Follow {
                enabled: *enabled,
                target: if *enabled { speaker } else { None },
            }),
            ActionIntent::SetMode { mode } => Some(RobotCommand::SetMode(*mode)),
            ActionIntent::RememberPerson { .. } | ActionIntent::Sleep => None,
        }
    }
}

/// Parsed reply of a cognition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CognitionReply {
    /// Text the robot says out loud. May be empty.
    pub speech: String,
    #[serde(default)]
    pub action: Option<ActionIntent>,
    /// When true the session ends after speaking.
    #[serde(default)]
    pub end_conversation: bool,
    #[serde(default)]
    pub internal_thought: Option<String>,
}

impl CognitionReply {
    pub fn speech_only(speech: impl Into<String>) -> Self {
        Self {
            speech: speech.into(),
            action: None,
            end_conversation: false,
            internal_thought: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Link state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    #[default]
    Connected,
    Degraded,
    Lost,
}

/// Payload of a successful heartbeat acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub battery_percent: u8,
    pub motion_mode: MotionMode,
}

/// Snapshot of the robot link as seen by the safety monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotLinkState {
    pub status: LinkStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub battery_percent: Option<u8>,
    pub motion_mode: MotionMode,
    pub consecutive_misses: u32,
}

/// Coarse conversation phase, published for the UI shell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationPhase {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    EmergencyStopped,
}

// ────────────────────────────────────────────────────────────────────────────
// Status events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the status bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "rex-kernel::safety"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: &str, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.to_string(),
            payload,
        }
    }
}

/// Variants of status routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Phase(ConversationPhase),
    Link(LinkStatus),
    LowBattery { percent: u8 },
    Heard(String),
    Spoke(String),
    EmergencyStop { reason: String },
    CommandDispatched { seq: u64, command: RobotCommand },
    CommandFailed { seq: u64, command: RobotCommand, error: String },
    PersonRecognized { person_id: PersonId, name: String, similarity: f32 },
    /// The cognition service's internal reasoning output
    AgentThought(String),
}

/// Global error type spanning link faults, service failures and
/// configuration problems.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RexError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Link fault: {details}")]
    LinkFault { details: String },

    #[error("{service} service failed: {details}")]
    Service { service: String, details: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Channel closed: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Interlock '{rule}' rejected command: {details}")]
    Interlock { rule: String, details: String },

    #[error("Action channel held by {holder}")]
    ChannelBusy { holder: String },
}

impl RexError {
    pub fn service(service: &str, details: impl fmt::Display) -> Self {
        RexError::Service {
            service: service.to_string(),
            details: details.to_string(),
        }
    }

    /// Whether this error is a link-level fault that the safety monitor
    /// should count against link health.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, RexError::LinkFault { .. } | RexError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robot_command_wire_shape() {
        let cmd = RobotCommand::Walk {
            direction: Direction::Left,
            speed: 0.25,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command"], "walk");
        assert_eq!(json["params"]["direction"], "left");

        let stop = serde_json::to_value(RobotCommand::Stop).unwrap();
        assert_eq!(stop["command"], "stop");
    }

    #[test]
    fn follow_intent_targets_speaker_only_when_enabled() {
        let speaker = PersonId::new();
        let on = ActionIntent::Follow { enabled: true }.to_command(Some(speaker));
        assert_eq!(
            on,
            Some(RobotCommand::Follow {
                enabled: true,
                target: Some(speaker)
            })
        );
        let off = ActionIntent::Follow { enabled: false }.to_command(Some(speaker));
        assert_eq!(
            off,
            Some(RobotCommand::Follow {
                enabled: false,
                target: None
            })
        );
    }

    #[test]
    fn non_motion_intents_have_no_command() {
        assert!(ActionIntent::Sleep.to_command(None).is_none());
        assert!(
            ActionIntent::RememberPerson {
                name: "Alice".into()
            }
            .to_command(None)
            .is_none()
        );
    }

    #[test]
    fn cognition_reply_defaults_optional_fields() {
        let reply: CognitionReply = serde_json::from_str(r#"{"speech":"Hi!"}"#).unwrap();
        assert_eq!(reply, CognitionReply::speech_only("Hi!"));
    }

    #[test]
    fn cognition_reply_parses_action() {
        let reply: CognitionReply = serde_json::from_str(
            r#"{"speech":"Sport mode!","action":{"type":"set_mode","mode":"sport"},"end_conversation":true}"#,
        )
        .unwrap();
        assert_eq!(
            reply.action,
            Some(ActionIntent::SetMode {
                mode: MotionMode::Sport
            })
        );
        assert!(reply.end_conversation);
    }

    #[test]
    fn rex_error_display() {
        let err = RexError::LinkFault {
            details: "heartbeat missed".into(),
        };
        assert_eq!(err.to_string(), "Link fault: heartbeat missed");
        assert!(err.is_link_fault());
        assert!(!RexError::Config("x".into()).is_link_fault());
    }

    #[test]
    fn default_link_state_is_connected() {
        let state = RobotLinkState::default();
        assert_eq!(state.status, LinkStatus::Connected);
        assert_eq!(state.consecutive_misses, 0);
        assert!(state.last_heartbeat.is_none());
    }
}
