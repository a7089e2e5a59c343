//! In-process simulated robot for tests and headless runs.
//!
//! [`SimLink`] records every acknowledged command and answers heartbeats
//! from a script, so link-loss scenarios can be replayed deterministically.
//!
//! ```rust
//! use rex_link::{RobotLink, SimLink};
//! use rex_types::RobotCommand;
//!
//! # tokio_test_block(async {
//! let link = SimLink::new();
//! link.script_heartbeats([true, false]);
//! link.send_command(1, &RobotCommand::Stop).await.unwrap();
//! assert_eq!(link.sent_commands(), vec![RobotCommand::Stop]);
//! assert!(link.heartbeat().await.is_ok());
//! assert!(link.heartbeat().await.is_err());
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f);
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rex_types::{Heartbeat, MotionMode, RexError, RobotCommand};

use crate::link::RobotLink;

struct SimState {
    sent: Vec<(u64, RobotCommand)>,
    heartbeat_script: VecDeque<bool>,
    online: bool,
    battery_percent: u8,
    motion_mode: MotionMode,
    ack_delay: Duration,
}

/// A simulated robot reachable without a network.
pub struct SimLink {
    state: Mutex<SimState>,
}

impl SimLink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                sent: Vec::new(),
                heartbeat_script: VecDeque::new(),
                online: true,
                battery_percent: 100,
                motion_mode: MotionMode::Normal,
                ack_delay: Duration::ZERO,
            }),
        }
    }

    /// Queue heartbeat outcomes (`true` = answered). Once the script runs
    /// out, heartbeats follow the online flag.
    pub fn script_heartbeats(&self, outcomes: impl IntoIterator<Item = bool>) {
        if let Ok(mut s) = self.state.lock() {
            s.heartbeat_script.extend(outcomes);
        }
    }

    /// Take the robot off the network (or bring it back).
    pub fn set_online(&self, online: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.online = online;
        }
    }

    pub fn set_battery(&self, percent: u8) {
        if let Ok(mut s) = self.state.lock() {
            s.battery_percent = percent;
        }
    }

    /// Delay every command acknowledgement by `delay`.
    pub fn set_ack_delay(&self, delay: Duration) {
        if let Ok(mut s) = self.state.lock() {
            s.ack_delay = delay;
        }
    }

    /// Commands acknowledged so far, in delivery order.
    pub fn sent_commands(&self) -> Vec<RobotCommand> {
        self.state
            .lock()
            .map(|s| s.sent.iter().map(|(_, c)| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Sequence numbers acknowledged so far, in delivery order.
    pub fn sent_seqs(&self) -> Vec<u64> {
        self.state
            .lock()
            .map(|s| s.sent.iter().map(|(seq, _)| *seq).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>, RexError> {
        self.state
            .lock()
            .map_err(|_| RexError::Channel("sim link state poisoned".into()))
    }
}

impl Default for SimLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RobotLink for SimLink {
    async fn send_command(&self, seq: u64, command: &RobotCommand) -> Result<(), RexError> {
        let delay = self.lock()?.ack_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut s = self.lock()?;
        if !s.online {
            return Err(RexError::LinkFault {
                details: "simulated robot offline".into(),
            });
        }
        if let RobotCommand::SetMode(mode) = command {
            s.motion_mode = *mode;
        }
        s.sent.push((seq, command.clone()));
        Ok(())
    }

    async fn heartbeat(&self) -> Result<Heartbeat, RexError> {
        let mut s = self.lock()?;
        let answered = s.heartbeat_script.pop_front().unwrap_or(s.online);
        if answered {
            Ok(Heartbeat {
                battery_percent: s.battery_percent,
                motion_mode: s.motion_mode,
            })
        } else {
            Err(RexError::Timeout("simulated heartbeat miss".into()))
        }
    }
}
