//! Append-only episodic memory records.

use chrono::{DateTime, Duration, Utc};
use rex_types::PersonId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Importance given to ordinary exchanges, on a 0–10 scale.
pub const DEFAULT_IMPORTANCE: f32 = 5.0;

/// A single remembered exchange or event. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// The person this memory is about, if any.
    pub subject: Option<PersonId>,
    pub summary: String,
    pub importance: f32,
}

impl MemoryEntry {
    pub fn new(subject: Option<PersonId>, summary: impl Into<String>, importance: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            subject,
            summary: summary.into(),
            importance,
        }
    }
}

/// Which entries [`MemoryStore::prune`](crate::MemoryStore::prune) removes:
/// those older than `max_age_days` *and* less important than
/// `keep_importance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrunePolicy {
    pub max_age_days: Option<i64>,
    pub keep_importance: f32,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            max_age_days: Some(90),
            keep_importance: 7.0,
        }
    }
}

impl PrunePolicy {
    pub fn should_prune(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        let Some(days) = self.max_age_days else {
            return false;
        };
        now - entry.timestamp > Duration::days(days) && entry.importance < self.keep_importance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aged(days: i64, importance: f32, now: DateTime<Utc>) -> MemoryEntry {
        MemoryEntry {
            timestamp: now - Duration::days(days),
            ..MemoryEntry::new(None, "x", importance)
        }
    }

    #[test]
    fn old_unimportant_entries_are_pruned() {
        let now = Utc::now();
        let policy = PrunePolicy {
            max_age_days: Some(30),
            keep_importance: 7.0,
        };
        assert!(policy.should_prune(&aged(31, 5.0, now), now));
        assert!(!policy.should_prune(&aged(31, 8.0, now), now));
        assert!(!policy.should_prune(&aged(10, 1.0, now), now));
    }

    #[test]
    fn no_max_age_keeps_everything() {
        let now = Utc::now();
        let policy = PrunePolicy {
            max_age_days: None,
            keep_importance: 10.0,
        };
        assert!(!policy.should_prune(&aged(3650, 0.0, now), now));
    }
}
