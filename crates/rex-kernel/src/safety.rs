//! [`SafetyMonitor`] – link health and battery state machine.
//!
//! The monitor is the only owner of [`RobotLinkState`]. The heartbeat worker
//! feeds it one [`HeartbeatOutcome`] per poll (and dispatch timeouts as
//! extra misses); the monitor answers with the [`SafetyAction`]s the caller
//! must carry out and publishes a fresh snapshot on a `watch` channel.
//!
//! ```text
//!            miss                 `loss_threshold` consecutive misses
//! Connected ─────▶ Degraded ──────────────────────────────────▶ Lost
//!     ▲                │                                          │
//!     └────────────────┴──── `recovery_threshold` consecutive ◀───┘
//!                             answered heartbeats
//! ```
//!
//! Entering `Lost` yields exactly one [`SafetyAction::EmergencyStop`];
//! further misses while Lost yield nothing. Recovery only clears the fault,
//! it never resumes motion.

use chrono::{DateTime, Utc};
use rex_types::{Heartbeat, LinkStatus, RobotLinkState};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Heartbeat and battery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Fixed polling interval of the heartbeat worker.
    pub heartbeat_interval_ms: u64,
    /// A heartbeat not answered within this budget counts as a miss.
    pub heartbeat_timeout_ms: u64,
    /// Consecutive misses (counted from the first) that make the link Lost.
    pub loss_threshold: u32,
    /// Consecutive answered heartbeats needed to return to Connected.
    pub recovery_threshold: u32,
    pub low_battery_percent: u8,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 800,
            loss_threshold: 3,
            recovery_threshold: 2,
            low_battery_percent: 20,
        }
    }
}

impl SafetyConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatOutcome {
    Answered(Heartbeat),
    Missed,
}

/// What the caller must do after feeding an outcome to the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyAction {
    StatusChanged { from: LinkStatus, to: LinkStatus },
    /// Inject a stop ahead of everything and force the conversation into
    /// `EmergencyStopped`.
    EmergencyStop { reason: String },
    /// Non-blocking warning; not a stop condition.
    LowBattery { percent: u8 },
}

pub struct SafetyMonitor {
    config: SafetyConfig,
    state: RobotLinkState,
    consecutive_successes: u32,
    stop_issued: bool,
    low_battery_warned: bool,
    snapshot: watch::Sender<RobotLinkState>,
}

impl SafetyMonitor {
    pub fn new(config: SafetyConfig) -> Self {
        let state = RobotLinkState::default();
        let (snapshot, _) = watch::channel(state.clone());
        Self {
            config,
            state,
            consecutive_successes: 0,
            stop_issued: false,
            low_battery_warned: false,
            snapshot,
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Read-only view of the link state for other workers.
    pub fn subscribe(&self) -> watch::Receiver<RobotLinkState> {
        self.snapshot.subscribe()
    }

    pub fn state(&self) -> &RobotLinkState {
        &self.state
    }

    /// Feed one heartbeat outcome observed at `now`.
    pub fn record(&mut self, outcome: HeartbeatOutcome, now: DateTime<Utc>) -> Vec<SafetyAction> {
        let mut actions = Vec::new();
        match outcome {
            HeartbeatOutcome::Missed => self.on_miss(&mut actions),
            HeartbeatOutcome::Answered(hb) => self.on_answer(hb, now, &mut actions),
        }
        self.snapshot.send_replace(self.state.clone());
        actions
    }

    /// A command that was never acknowledged counts against the link like a
    /// missed heartbeat.
    pub fn record_dispatch_timeout(&mut self, now: DateTime<Utc>) -> Vec<SafetyAction> {
        self.record(HeartbeatOutcome::Missed, now)
    }

    fn on_miss(&mut self, actions: &mut Vec<SafetyAction>) {
        self.consecutive_successes = 0;
        self.state.consecutive_misses = self.state.consecutive_misses.saturating_add(1);

        let next = if self.state.status == LinkStatus::Lost
            || self.state.consecutive_misses >= self.config.loss_threshold
        {
            LinkStatus::Lost
        } else {
            LinkStatus::Degraded
        };
        self.transition(next, actions);

        if next == LinkStatus::Lost && !self.stop_issued {
            self.stop_issued = true;
            let reason = format!(
                "robot link lost after {} missed heartbeats",
                self.state.consecutive_misses
            );
            warn!(%reason, "safety stop");
            actions.push(SafetyAction::EmergencyStop { reason });
        }
    }

    fn on_answer(&mut self, hb: Heartbeat, now: DateTime<Utc>, actions: &mut Vec<SafetyAction>) {
        self.state.last_heartbeat = Some(now);
        self.state.battery_percent = Some(hb.battery_percent);
        self.state.motion_mode = hb.motion_mode;
        self.state.consecutive_misses = 0;

        if self.state.status != LinkStatus::Connected {
            self.consecutive_successes += 1;
            if self.consecutive_successes >= self.config.recovery_threshold {
                self.consecutive_successes = 0;
                self.stop_issued = false;
                self.transition(LinkStatus::Connected, actions);
            }
        }

        if hb.battery_percent < self.config.low_battery_percent {
            if !self.low_battery_warned {
                self.low_battery_warned = true;
                warn!(percent = hb.battery_percent, "battery low");
                actions.push(SafetyAction::LowBattery {
                    percent: hb.battery_percent,
                });
            }
        } else {
            self.low_battery_warned = false;
        }
    }

    fn transition(&mut self, to: LinkStatus, actions: &mut Vec<SafetyAction>) {
        let from = self.state.status;
        if from == to {
            return;
        }
        info!(?from, ?to, misses = self.state.consecutive_misses, "link status changed");
        self.state.status = to;
        actions.push(SafetyAction::StatusChanged { from, to });
    }
}
