//! [`WakeDetector`] – turns speech-to-text fragments into conversation events.
//!
//! The speech-to-text collaborator ([`SpeechRecognizer`]) is fed audio and
//! yields partial/final [`TranscriptFragment`]s. The detector classifies
//! those into [`WakeEvent`]s:
//!
//! | Event | Emitted when |
//! |---|---|
//! | `EmergencyPhrase` | the stop word sits next to the robot name, in any fragment |
//! | `Wake` | a *final* fragment contains a wake phrase above the wake threshold |
//! | `PartialTranscript` | a new, different partial arrives |
//! | `FinalTranscript` | a final fragment arrives |
//! | `Silence(d)` | no speech for the end-of-utterance threshold |
//!
//! Once the emergency phrase is heard, the rest of that utterance yields
//! nothing else, so a wake phrase in the same breath can never win.
//! Fragments under the transcript threshold are treated as noise.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rex_types::RexError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sensor::{AudioFrame, SensorFeed};

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    pub text: String,
    pub is_final: bool,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f32,
}

impl TranscriptFragment {
    pub fn partial(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence,
        }
    }

    pub fn final_text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence,
        }
    }
}

/// Streaming speech-to-text collaborator.
#[async_trait]
pub trait SpeechRecognizer: Send {
    /// Feed one audio frame and collect whatever fragments it completed.
    async fn push_audio(&mut self, frame: &AudioFrame) -> Result<Vec<TranscriptFragment>, RexError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WakeEvent {
    Wake { confidence: f32 },
    EmergencyPhrase { text: String },
    PartialTranscript(String),
    FinalTranscript(String),
    Silence(Duration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    pub robot_name: String,
    /// Phrases besides the robot name that wake it up.
    pub extra_wake_phrases: Vec<String>,
    pub stop_word: String,
    pub wake_confidence: f32,
    /// Lower than the wake threshold: a missed stop is worse than a false one.
    pub emergency_confidence: f32,
    /// Below this a fragment is noise.
    pub transcript_confidence: f32,
    pub end_of_utterance_silence_ms: u64,
    pub silence_poll_ms: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            robot_name: "Rex".to_string(),
            extra_wake_phrases: Vec::new(),
            stop_word: "stop".to_string(),
            wake_confidence: 0.6,
            emergency_confidence: 0.4,
            transcript_confidence: 0.3,
            end_of_utterance_silence_ms: 800,
            silence_poll_ms: 100,
        }
    }
}

/// Lowercase, drop punctuation and split into words.
fn normalize(text: &str) -> Vec<String> {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn contains_phrase(words: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && words.windows(phrase.len()).any(|w| w == phrase)
}

#[derive(Debug, Default)]
struct Utterance {
    last_speech: Option<Instant>,
    emergency_heard: bool,
    last_partial: Option<String>,
}

pub struct WakeDetector {
    config: WakeConfig,
    wake_phrases: Vec<Vec<String>>,
    emergency_phrases: [Vec<String>; 2],
    utterance: Utterance,
}

impl WakeDetector {
    pub fn new(config: WakeConfig) -> Self {
        let name = normalize(&config.robot_name);
        let stop = normalize(&config.stop_word);
        let mut wake_phrases = vec![name.clone()];
        wake_phrases.extend(config.extra_wake_phrases.iter().map(|p| normalize(p)));
        wake_phrases.retain(|p| !p.is_empty());
        let emergency_phrases = [
            [stop.clone(), name.clone()].concat(),
            [name, stop].concat(),
        ];
        Self {
            config,
            wake_phrases,
            emergency_phrases,
            utterance: Utterance::default(),
        }
    }

    pub fn config(&self) -> &WakeConfig {
        &self.config
    }

    fn is_emergency(&self, words: &[String]) -> bool {
        self.emergency_phrases.iter().any(|p| contains_phrase(words, p))
    }

    fn is_wake(&self, words: &[String]) -> bool {
        self.wake_phrases.iter().any(|p| contains_phrase(words, p))
    }

    /// Classify one fragment received at `now`.
    pub fn classify(&mut self, fragment: &TranscriptFragment, now: Instant) -> Vec<WakeEvent> {
        let mut events = Vec::new();
        self.utterance.last_speech = Some(now);
        let words = normalize(&fragment.text);

        if !self.utterance.emergency_heard
            && fragment.confidence >= self.config.emergency_confidence
            && self.is_emergency(&words)
        {
            self.utterance.emergency_heard = true;
            info!(text = %fragment.text, "emergency phrase heard");
            events.push(WakeEvent::EmergencyPhrase {
                text: fragment.text.clone(),
            });
        }

        if self.utterance.emergency_heard {
            if fragment.is_final {
                self.end_utterance();
            }
            return events;
        }

        if fragment.confidence < self.config.transcript_confidence || words.is_empty() {
            debug!(confidence = fragment.confidence, "fragment below threshold ignored");
            return events;
        }

        if !fragment.is_final {
            if self.utterance.last_partial.as_deref() != Some(fragment.text.as_str()) {
                self.utterance.last_partial = Some(fragment.text.clone());
                events.push(WakeEvent::PartialTranscript(fragment.text.clone()));
            }
            return events;
        }

        if fragment.confidence >= self.config.wake_confidence && self.is_wake(&words) {
            events.push(WakeEvent::Wake {
                confidence: fragment.confidence,
            });
        }
        events.push(WakeEvent::FinalTranscript(fragment.text.clone()));
        self.end_utterance();
        events
    }

    /// Report trailing silence once it reaches the end-of-utterance
    /// threshold. Emits at most once per stretch of silence.
    pub fn poll_silence(&mut self, now: Instant) -> Option<WakeEvent> {
        let last = self.utterance.last_speech?;
        let quiet = now.saturating_duration_since(last);
        if quiet < Duration::from_millis(self.config.end_of_utterance_silence_ms) {
            return None;
        }
        self.utterance = Utterance::default();
        Some(WakeEvent::Silence(quiet))
    }

    fn end_utterance(&mut self) {
        self.utterance.emergency_heard = false;
        self.utterance.last_partial = None;
    }

    /// Classify fragments until the fragment stream ends or the event
    /// consumer goes away.
    pub async fn run(
        mut self,
        mut fragments: mpsc::Receiver<TranscriptFragment>,
        events: mpsc::Sender<WakeEvent>,
    ) {
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.silence_poll_ms.max(1)));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let produced = tokio::select! {
                fragment = fragments.recv() => match fragment {
                    Some(f) => self.classify(&f, Instant::now()),
                    None => break,
                },
                _ = poll.tick() => self.poll_silence(Instant::now()).into_iter().collect(),
            };
            for event in produced {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
        debug!("wake detector stopped");
    }
}

/// Pump audio frames through `recognizer`, forwarding every fragment.
///
/// Recognizer failures are transient: the frame is skipped and the stream
/// continues.
pub async fn transcribe<R: SpeechRecognizer>(
    mut recognizer: R,
    mut audio: SensorFeed<AudioFrame>,
    fragments: mpsc::Sender<TranscriptFragment>,
) {
    while let Some(frame) = audio.next().await {
        match recognizer.push_audio(&frame).await {
            Ok(batch) => {
                for fragment in batch {
                    if fragments.send(fragment).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "speech recognizer failed, skipping frame"),
        }
    }
}
