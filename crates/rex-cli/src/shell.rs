//! Interactive development shell.
//!
//! Supported slash-commands:
//!   /help         – show this list
//!   /status       – link state and conversation phase
//!   /stop         – emergency stop
//!   /resume       – leave the emergency stop
//!   /quit | /exit – stop the robot and exit
//!
//! Any other line is handed to the agent as a spoken, final transcript.

use std::sync::Arc;

use colored::Colorize;
use rex_perception::TranscriptFragment;
use rex_runtime::AgentHandle;
use rex_types::{Event, EventPayload, LinkStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Notify, broadcast};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Help,
    Status,
    Stop,
    Resume,
    Quit,
    Say(String),
    Unknown(String),
    Empty,
}

pub fn parse_line(line: &str) -> ShellCommand {
    let line = line.trim();
    match line {
        "" => ShellCommand::Empty,
        "/help" => ShellCommand::Help,
        "/status" => ShellCommand::Status,
        "/stop" => ShellCommand::Stop,
        "/resume" => ShellCommand::Resume,
        "/quit" | "/exit" => ShellCommand::Quit,
        other if other.starts_with('/') => ShellCommand::Unknown(other.to_string()),
        other => ShellCommand::Say(other.to_string()),
    }
}

/// Read stdin until `/quit`, end of input, or `interrupted` fires.
pub async fn run(agent: &AgentHandle, interrupted: Arc<Notify>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let transcripts = agent.transcripts();

    loop {
        let line = tokio::select! {
            _ = interrupted.notified() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            },
        };

        match parse_line(&line) {
            ShellCommand::Empty => {}
            ShellCommand::Help => print_help(),
            ShellCommand::Status => {
                let link = agent.link_state();
                let status = match link.status {
                    LinkStatus::Connected => "connected".green(),
                    LinkStatus::Degraded => "degraded".yellow(),
                    LinkStatus::Lost => "lost".red(),
                };
                let battery = link
                    .battery_percent
                    .map_or_else(|| "?".to_string(), |p| format!("{p}%"));
                println!(
                    "  link {}  battery {}  mode {:?}  phase {:?}",
                    status,
                    battery.bold(),
                    link.motion_mode,
                    agent.phase()
                );
            }
            ShellCommand::Stop => agent.emergency_stop(),
            ShellCommand::Resume => {
                if let Err(e) = agent.resume().await {
                    warn!(error = %e, "resume failed");
                }
            }
            ShellCommand::Quit => break,
            ShellCommand::Unknown(cmd) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                cmd.yellow(),
                "/help".bold()
            ),
            ShellCommand::Say(text) => {
                if transcripts.send(TranscriptFragment::final_text(text, 1.0)).await.is_err() {
                    warn!("wake detector gone, transcript dropped");
                    break;
                }
            }
        }
    }
}

pub fn print_help() {
    println!();
    println!("  {}", "Commands".bold().underline());
    println!("  {}   link state and conversation phase", "/status".cyan());
    println!("  {}     emergency stop", "/stop".cyan());
    println!("  {}   leave the emergency stop", "/resume".cyan());
    println!("  {}     stop the robot and exit", "/quit".cyan());
    println!("  Anything else is heard as speech, e.g. {}", "Rex, sit down".italic());
    println!();
}

/// One status line for an event, or `None` for events the console voice
/// already shows.
pub fn describe(event: &Event) -> Option<String> {
    let line = match &event.payload {
        EventPayload::Phase(phase) => format!("  [{phase:?}]").dimmed().to_string(),
        EventPayload::Link(LinkStatus::Connected) => "  link connected".green().to_string(),
        EventPayload::Link(LinkStatus::Degraded) => "  link degraded".yellow().to_string(),
        EventPayload::Link(LinkStatus::Lost) => "  link LOST".red().bold().to_string(),
        EventPayload::LowBattery { percent } => format!("  battery low: {percent}%").yellow().to_string(),
        EventPayload::Heard(text) => format!("  heard: {text}").dimmed().to_string(),
        EventPayload::Spoke(_) => return None,
        EventPayload::EmergencyStop { reason } => {
            format!("  ⚠ EMERGENCY STOP: {reason}").red().bold().to_string()
        }
        EventPayload::CommandDispatched { seq, command } => {
            format!("  → #{seq} {}", command.name()).cyan().to_string()
        }
        EventPayload::CommandFailed { seq, command, error } => {
            format!("  ✗ #{seq} {} failed: {error}", command.name()).red().to_string()
        }
        EventPayload::PersonRecognized { name, similarity, .. } => {
            format!("  👀 {name} ({similarity:.2})")
        }
        EventPayload::AgentThought(thought) => format!("  💭 {thought}").dimmed().italic().to_string(),
    };
    Some(line)
}

/// Print bus events until the bus goes away.
pub async fn render(mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = describe(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "status display fell behind"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rex_types::{ConversationPhase, RobotCommand};

    #[test]
    fn slash_commands_are_recognized() {
        assert_eq!(parse_line("/status"), ShellCommand::Status);
        assert_eq!(parse_line("  /stop  "), ShellCommand::Stop);
        assert_eq!(parse_line("/resume"), ShellCommand::Resume);
        assert_eq!(parse_line("/exit"), ShellCommand::Quit);
        assert_eq!(parse_line("/help"), ShellCommand::Help);
        assert_eq!(parse_line("/dance"), ShellCommand::Unknown("/dance".into()));
    }

    #[test]
    fn plain_lines_are_speech() {
        assert_eq!(parse_line("Rex, sit down"), ShellCommand::Say("Rex, sit down".into()));
        assert_eq!(parse_line("   "), ShellCommand::Empty);
    }

    #[test]
    fn spoken_text_is_left_to_the_voice() {
        let event = Event::new("test", EventPayload::Spoke("hello".into()));
        assert!(describe(&event).is_none());
    }

    #[test]
    fn status_events_are_described() {
        colored::control::set_override(false);
        let phase = Event::new("test", EventPayload::Phase(ConversationPhase::Listening));
        assert_eq!(describe(&phase).as_deref(), Some("  [Listening]"));

        let sent = Event::new(
            "test",
            EventPayload::CommandDispatched {
                seq: 4,
                command: RobotCommand::Stop,
            },
        );
        assert_eq!(describe(&sent).as_deref(), Some("  → #4 stop"));

        let stop = Event::new("test", EventPayload::EmergencyStop { reason: "link lost".into() });
        assert!(describe(&stop).unwrap().contains("link lost"));
    }
}
