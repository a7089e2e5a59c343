//! [`Person`] – a face the robot knows.

use chrono::{DateTime, Utc};
use rex_types::PersonId;
use serde::{Deserialize, Serialize};

use crate::embedding::cosine_similarity;

/// Fingerprint samples kept per person; the oldest is dropped beyond this.
pub const MAX_FINGERPRINTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    /// Face embeddings, oldest first.
    pub fingerprints: Vec<Vec<f32>>,
    pub last_seen: DateTime<Utc>,
    /// No greeting is offered before this instant.
    pub greet_cooldown_until: Option<DateTime<Utc>>,
    /// One of the robot's configured owners.
    pub is_master: bool,
    pub created_at: DateTime<Utc>,
}

impl Person {
    pub fn new(name: &str, fingerprint: Vec<f32>, is_master: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: PersonId::new(),
            name: name.to_string(),
            fingerprints: vec![fingerprint],
            last_seen: now,
            greet_cooldown_until: None,
            is_master,
            created_at: now,
        }
    }

    /// Best cosine similarity between `embedding` and any stored sample.
    pub fn similarity(&self, embedding: &[f32]) -> f32 {
        self.fingerprints
            .iter()
            .map(|f| cosine_similarity(f, embedding))
            .fold(f32::MIN, f32::max)
    }

    pub fn greeting_due(&self, now: DateTime<Utc>) -> bool {
        self.greet_cooldown_until.is_none_or(|until| now >= until)
    }

    /// Append a sample, dropping the oldest past [`MAX_FINGERPRINTS`].
    pub(crate) fn add_fingerprint(&mut self, embedding: Vec<f32>) {
        self.fingerprints.push(embedding);
        if self.fingerprints.len() > MAX_FINGERPRINTS {
            let excess = self.fingerprints.len() - MAX_FINGERPRINTS;
            self.fingerprints.drain(..excess);
        }
    }
}
