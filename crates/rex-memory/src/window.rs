//! [`ConversationWindow`] – the rolling short-term context.
//!
//! Holds the most recent `capacity` turns of the current session, oldest
//! first. Resetting starts a new session and forgets every turn.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Robot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationWindow {
    capacity: usize,
    turns: VecDeque<ConversationTurn>,
    session: u64,
}

impl ConversationWindow {
    /// A window keeping at most `capacity` turns (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            turns: VecDeque::with_capacity(capacity),
            session: 0,
        }
    }

    pub fn push(&mut self, role: TurnRole, text: impl Into<String>, at: DateTime<Utc>) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(ConversationTurn {
            role,
            text: text.into(),
            timestamp: at,
        });
    }

    /// Turns of the current session, oldest first.
    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Monotonic session counter, bumped by every [`reset`](Self::reset).
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.turns.back().map(|t| t.timestamp)
    }

    /// True when the last turn is older than `timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.last_activity().is_some_and(|last| now - last > timeout)
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.session += 1;
    }
}
