//! The robot motion link contract.
//!
//! Every transport to the robot implements [`RobotLink`]. Commands carry the
//! dispatcher's sequence number and resolve only once the robot acknowledges
//! them; heartbeats resolve with the robot's battery and motion mode.
//! Timeouts are the caller's business: the dispatcher and the safety
//! monitor each wrap calls in [`tokio::time::timeout`] with their own budget.
//!
//! # Wire protocol
//!
//! Frames are JSON text messages tagged by `type`:
//!
//! ```text
//! → {"type":"command","seq":7,"command":{"command":"walk","params":{"direction":"left","speed":0.3}}}
//! ← {"type":"ack","seq":7}
//! → {"type":"heartbeat","seq":12}
//! ← {"type":"heartbeat_ack","seq":12,"battery_percent":81,"motion_mode":"normal"}
//! ```

use async_trait::async_trait;
use rex_types::{Heartbeat, MotionMode, RexError, RobotCommand};
use serde::{Deserialize, Serialize};

/// Every transport to the robot must implement this trait.
#[async_trait]
pub trait RobotLink: Send + Sync {
    /// Send `command` tagged with `seq` and wait for its acknowledgement.
    async fn send_command(&self, seq: u64, command: &RobotCommand) -> Result<(), RexError>;

    /// Probe the robot and return its reported state.
    async fn heartbeat(&self) -> Result<Heartbeat, RexError>;
}

/// One JSON frame on the link, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkFrame {
    Command { seq: u64, command: RobotCommand },
    Heartbeat { seq: u64 },
    Ack { seq: u64 },
    Nack { seq: u64, reason: String },
    HeartbeatAck {
        seq: u64,
        battery_percent: u8,
        motion_mode: MotionMode,
    },
}

/// Which outstanding request a reply frame resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKey {
    Command(u64),
    Heartbeat(u64),
}

impl LinkFrame {
    /// Key of the request this frame answers, `None` for outbound frames.
    pub fn reply_key(&self) -> Option<ReplyKey> {
        match self {
            LinkFrame::Ack { seq } | LinkFrame::Nack { seq, .. } => Some(ReplyKey::Command(*seq)),
            LinkFrame::HeartbeatAck { seq, .. } => Some(ReplyKey::Heartbeat(*seq)),
            LinkFrame::Command { .. } | LinkFrame::Heartbeat { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rex_types::Gesture;

    #[test]
    fn command_frame_wire_shape() {
        let frame = LinkFrame::Command {
            seq: 3,
            command: RobotCommand::Gesture(Gesture::Sit),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["command"]["command"], "gesture");
        assert_eq!(json["command"]["params"], "sit");
    }

    #[test]
    fn heartbeat_ack_parses_and_keys_to_heartbeat() {
        let frame: LinkFrame = serde_json::from_str(
            r#"{"type":"heartbeat_ack","seq":9,"battery_percent":55,"motion_mode":"sport"}"#,
        )
        .unwrap();
        assert_eq!(frame.reply_key(), Some(ReplyKey::Heartbeat(9)));
    }

    #[test]
    fn ack_and_nack_key_to_command() {
        let ack = LinkFrame::Ack { seq: 4 };
        let nack = LinkFrame::Nack {
            seq: 4,
            reason: "busy".into(),
        };
        assert_eq!(ack.reply_key(), Some(ReplyKey::Command(4)));
        assert_eq!(nack.reply_key(), Some(ReplyKey::Command(4)));
        assert_eq!(LinkFrame::Heartbeat { seq: 1 }.reply_key(), None);
    }
}
