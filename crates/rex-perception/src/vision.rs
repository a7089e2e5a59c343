//! [`VisionTracker`] – who is in front of the robot, and what it sees.
//!
//! The camera feed is sampled, not consumed frame by frame: a
//! [`governor`] rate limiter admits one face analysis per
//! `sample_interval_ms` and one scene description per `scene_interval_ms`;
//! every other frame is dropped on the floor.
//!
//! For each admitted sample the detected faces are matched against the
//! known fingerprints in [`MemoryStore`]:
//!
//! - similarity ≥ `match_threshold` → [`VisionEvent::PersonRecognized`]
//!   (at most once per person per greeting cooldown);
//! - similarity < `unknown_threshold` for `unknown_window_ms` in a row →
//!   one [`VisionEvent::UnknownPersonSeen`] carrying the fingerprint;
//! - anything in between is ambiguous and yields nothing.
//!
//! Enrollment is not done here; cognition decides whether to remember a
//! newcomer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use governor::{Quota, RateLimiter};
use rex_memory::{MemoryStore, Person};
use rex_types::{PersonId, RexError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sensor::{CameraFrame, SensorFeed};

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub embedding: Vec<f32>,
    /// Detector confidence that this is a face at all.
    pub confidence: f32,
}

/// Face detection and embedding collaborator.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn detect_faces(&self, frame: &CameraFrame) -> Result<Vec<DetectedFace>, RexError>;
}

/// Vision-language collaborator producing a short scene summary.
#[async_trait]
pub trait SceneDescriber: Send + Sync {
    async fn describe(&self, frame: &CameraFrame) -> Result<String, RexError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub description: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VisionEvent {
    PersonRecognized { person: Person, similarity: f32 },
    UnknownPersonSeen { fingerprint: Vec<f32> },
    SceneDescription(SceneSnapshot),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub sample_interval_ms: u64,
    pub scene_interval_ms: u64,
    pub match_threshold: f32,
    pub unknown_threshold: f32,
    pub unknown_window_ms: u64,
    pub min_face_confidence: f32,
    pub greeting_cooldown_secs: i64,
    /// Add each confident match as a new fingerprint sample.
    pub learn_fingerprints: bool,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2500,
            scene_interval_ms: 10_000,
            match_threshold: 0.6,
            unknown_threshold: 0.4,
            unknown_window_ms: 3000,
            min_face_confidence: 0.7,
            greeting_cooldown_secs: 3600,
            learn_fingerprints: true,
        }
    }
}

impl VisionConfig {
    pub fn greeting_cooldown(&self) -> Duration {
        Duration::seconds(self.greeting_cooldown_secs)
    }
}

pub struct VisionTracker {
    config: VisionConfig,
    memory: Arc<MemoryStore>,
    recognized_at: HashMap<PersonId, DateTime<Utc>>,
    unknown_since: Option<DateTime<Utc>>,
    unknown_reported: bool,
}

impl VisionTracker {
    pub fn new(config: VisionConfig, memory: Arc<MemoryStore>) -> Self {
        Self {
            config,
            memory,
            recognized_at: HashMap::new(),
            unknown_since: None,
            unknown_reported: false,
        }
    }

    /// Match one sample's faces against known people.
    pub fn process_faces(&mut self, faces: &[DetectedFace], now: DateTime<Utc>) -> Vec<VisionEvent> {
        let cooldown = self.config.greeting_cooldown();
        self.recognized_at.retain(|_, at| now - *at < cooldown);

        let mut events = Vec::new();
        let mut unknown: Option<&DetectedFace> = None;

        for face in faces
            .iter()
            .filter(|f| f.confidence >= self.config.min_face_confidence && !f.embedding.is_empty())
        {
            match self.memory.identify(&face.embedding) {
                Some((person, similarity)) if similarity >= self.config.match_threshold => {
                    let sample = self.config.learn_fingerprints.then(|| face.embedding.clone());
                    let person = match self.memory.record_sighting(person.id, sample, now) {
                        Ok(updated) => updated,
                        Err(e) => {
                            warn!(person_id = %person.id, error = %e, "failed to record sighting");
                            person
                        }
                    };
                    if self.recognized_at.contains_key(&person.id) {
                        debug!(person_id = %person.id, "recognition cached, not re-announced");
                        continue;
                    }
                    self.recognized_at.insert(person.id, now);
                    info!(person_id = %person.id, name = %person.name, similarity, "person recognized");
                    events.push(VisionEvent::PersonRecognized { person, similarity });
                }
                Some((_, similarity)) if similarity >= self.config.unknown_threshold => {
                    debug!(similarity, "ambiguous face ignored");
                }
                _ => {
                    unknown.get_or_insert(face);
                }
            }
        }

        match unknown {
            Some(face) => {
                let since = *self.unknown_since.get_or_insert(now);
                let window = Duration::milliseconds(self.config.unknown_window_ms as i64);
                if !self.unknown_reported && now - since >= window {
                    self.unknown_reported = true;
                    info!("unknown person in view");
                    events.push(VisionEvent::UnknownPersonSeen {
                        fingerprint: face.embedding.clone(),
                    });
                }
            }
            None => {
                self.unknown_since = None;
                self.unknown_reported = false;
            }
        }
        events
    }

    /// Sample `frames` until the feed ends or the consumer goes away.
    ///
    /// Collaborator failures skip the sample; the next admitted frame is a
    /// retry.
    pub async fn run(
        mut self,
        embedder: Arc<dyn FaceEmbedder>,
        describer: Option<Arc<dyn SceneDescriber>>,
        mut frames: SensorFeed<CameraFrame>,
        events: mpsc::Sender<VisionEvent>,
    ) -> Result<(), RexError> {
        let faces_quota = quota(self.config.sample_interval_ms)?;
        let scene_quota = quota(self.config.scene_interval_ms)?;
        let face_limiter = RateLimiter::direct(faces_quota);
        let scene_limiter = RateLimiter::direct(scene_quota);

        while let Some(frame) = frames.next().await {
            let mut produced = Vec::new();
            if face_limiter.check().is_ok() {
                match embedder.detect_faces(&frame).await {
                    Ok(faces) => produced.extend(self.process_faces(&faces, Utc::now())),
                    Err(e) => warn!(error = %e, "face detection failed, retrying next sample"),
                }
            }
            if let Some(describer) = &describer {
                if scene_limiter.check().is_ok() {
                    match describer.describe(&frame).await {
                        Ok(description) => produced.push(VisionEvent::SceneDescription(SceneSnapshot {
                            description,
                            captured_at: Utc::now(),
                        })),
                        Err(e) => warn!(error = %e, "scene description failed"),
                    }
                }
            }
            for event in produced {
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn quota(interval_ms: u64) -> Result<Quota, RexError> {
    Quota::with_period(StdDuration::from_millis(interval_ms))
        .ok_or_else(|| RexError::Config("vision sampling interval must be non-zero".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::sensor_channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn face(embedding: Vec<f32>) -> DetectedFace {
        DetectedFace {
            embedding,
            confidence: 0.95,
        }
    }

    fn tracker_with_alice() -> (VisionTracker, Person) {
        let memory = Arc::new(MemoryStore::open_in_memory().unwrap());
        let alice = memory
            .enroll_person("Alice", vec![1.0, 0.0, 0.0], false, Utc::now())
            .unwrap();
        (VisionTracker::new(VisionConfig::default(), memory), alice)
    }

    #[test]
    fn known_face_is_recognized_once_per_cooldown() {
        let (mut t, alice) = tracker_with_alice();
        let t0 = Utc::now();
        let first = t.process_faces(&[face(vec![0.95, 0.05, 0.0])], t0);
        assert!(matches!(
            first.as_slice(),
            [VisionEvent::PersonRecognized { person, .. }] if person.id == alice.id
        ));
        let again = t.process_faces(&[face(vec![0.95, 0.05, 0.0])], t0 + Duration::seconds(1800));
        assert!(again.is_empty());
        let later = t.process_faces(&[face(vec![0.95, 0.05, 0.0])], t0 + Duration::seconds(3601));
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn recognition_updates_last_seen() {
        let (mut t, alice) = tracker_with_alice();
        let t0 = Utc::now() + Duration::seconds(10);
        t.process_faces(&[face(vec![1.0, 0.0, 0.0])], t0);
        assert_eq!(t.memory.person(alice.id).unwrap().last_seen, t0);
    }

    #[test]
    fn ambiguous_face_yields_nothing() {
        let (mut t, _) = tracker_with_alice();
        // cos ≈ 0.5: between the unknown and match thresholds.
        let events = t.process_faces(&[face(vec![0.5, 0.866, 0.0])], Utc::now());
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_face_reported_after_sustained_window() {
        let (mut t, _) = tracker_with_alice();
        let stranger = face(vec![0.0, 0.0, 1.0]);
        let t0 = Utc::now();
        assert!(t.process_faces(&[stranger.clone()], t0).is_empty());
        assert!(t
            .process_faces(&[stranger.clone()], t0 + Duration::milliseconds(2500))
            .is_empty());
        let events = t.process_faces(&[stranger.clone()], t0 + Duration::milliseconds(3000));
        assert_eq!(
            events,
            vec![VisionEvent::UnknownPersonSeen {
                fingerprint: vec![0.0, 0.0, 1.0]
            }]
        );
        // Reported once while they stay in view.
        assert!(t
            .process_faces(&[stranger], t0 + Duration::milliseconds(6000))
            .is_empty());
    }

    #[test]
    fn unknown_window_restarts_when_face_leaves() {
        let (mut t, _) = tracker_with_alice();
        let stranger = face(vec![0.0, 0.0, 1.0]);
        let t0 = Utc::now();
        t.process_faces(&[stranger.clone()], t0);
        t.process_faces(&[], t0 + Duration::milliseconds(2000));
        assert!(t
            .process_faces(&[stranger], t0 + Duration::milliseconds(4000))
            .is_empty());
    }

    #[test]
    fn empty_store_sees_everyone_as_unknown() {
        let memory = Arc::new(MemoryStore::open_in_memory().unwrap());
        let mut t = VisionTracker::new(
            VisionConfig {
                unknown_window_ms: 0,
                ..VisionConfig::default()
            },
            memory,
        );
        let events = t.process_faces(&[face(vec![0.3, 0.3, 0.3])], Utc::now());
        assert!(matches!(events.as_slice(), [VisionEvent::UnknownPersonSeen { .. }]));
    }

    #[test]
    fn low_confidence_detections_are_ignored() {
        let (mut t, _) = tracker_with_alice();
        let blurry = DetectedFace {
            embedding: vec![1.0, 0.0, 0.0],
            confidence: 0.3,
        };
        assert!(t.process_faces(&[blurry], Utc::now()).is_empty());
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FaceEmbedder for CountingEmbedder {
        async fn detect_faces(&self, _frame: &CameraFrame) -> Result<Vec<DetectedFace>, RexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![face(vec![1.0, 0.0, 0.0])])
        }
    }

    struct FixedScene;

    #[async_trait]
    impl SceneDescriber for FixedScene {
        async fn describe(&self, _frame: &CameraFrame) -> Result<String, RexError> {
            Ok("a kitchen".into())
        }
    }

    #[tokio::test]
    async fn run_samples_at_most_once_per_interval() {
        let (tracker, _) = tracker_with_alice();
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let (frame_tx, frames) = sensor_channel(64);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        for _ in 0..20 {
            assert!(frame_tx.offer(CameraFrame {
                width: 1,
                height: 1,
                data: vec![0; 3],
                captured_at: Instant::now(),
            }));
        }
        drop(frame_tx);

        tracker
            .run(embedder.clone(), Some(Arc::new(FixedScene)), frames, event_tx)
            .await
            .unwrap();

        // A burst of frames well inside one interval is one sample.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            event_rx.recv().await,
            Some(VisionEvent::PersonRecognized { .. })
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(VisionEvent::SceneDescription(SceneSnapshot { ref description, .. })) if description == "a kitchen"
        ));
    }

    #[test]
    fn zero_interval_is_a_config_error() {
        assert!(quota(0).is_err());
    }
}
