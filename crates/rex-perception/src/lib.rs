//! `rex-perception` – Senses.
//!
//! Turns raw sensor streams into the discrete events the conversation and
//! behavior layers react to.
//!
//! # Modules
//!
//! - [`sensor`] – [`SensorFeed`][sensor::SensorFeed]: bounded, lazy frame
//!   sequences with explicit backpressure policy.
//! - [`wake`] – [`WakeDetector`][wake::WakeDetector]: wake phrase, emergency
//!   phrase, transcripts and end-of-utterance silence.
//! - [`vision`] – [`VisionTracker`][vision::VisionTracker]: rate-limited face
//!   matching against known people and scene summaries.

pub mod sensor;
pub mod vision;
pub mod wake;

pub use sensor::{AudioFrame, CameraFrame, FeedSender, SensorFeed, sensor_channel};
pub use vision::{
    DetectedFace, FaceEmbedder, SceneDescriber, SceneSnapshot, VisionConfig, VisionEvent,
    VisionTracker,
};
pub use wake::{
    SpeechRecognizer, TranscriptFragment, WakeConfig, WakeDetector, WakeEvent, transcribe,
};
