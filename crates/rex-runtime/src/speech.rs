//! Text-to-speech collaborator.
//!
//! Playback must be cancellable mid-utterance: barge-in and emergency stop
//! both cut the robot off by cancelling the token passed to
//! [`TextToSpeech::speak`].

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rex_types::RexError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    Completed,
    Cancelled,
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize and play `text`, returning early once `cancel` fires.
    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<SpeechOutcome, RexError>;
}

/// Prints utterances to stdout and "plays" them for a time proportional to
/// their length.
pub struct ConsoleVoice {
    per_char: Duration,
    spoken: Mutex<Vec<String>>,
}

impl ConsoleVoice {
    pub fn new(per_char: Duration) -> Self {
        Self {
            per_char,
            spoken: Mutex::new(Vec::new()),
        }
    }

    /// Utterances that started playing, in order.
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for ConsoleVoice {
    fn default() -> Self {
        Self::new(Duration::from_millis(40))
    }
}

#[async_trait]
impl TextToSpeech for ConsoleVoice {
    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<SpeechOutcome, RexError> {
        if let Ok(mut spoken) = self.spoken.lock() {
            spoken.push(text.to_string());
        }
        println!("🔊 {text}");
        let playback = self.per_char.saturating_mul(text.chars().count() as u32);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("playback cancelled");
                Ok(SpeechOutcome::Cancelled)
            }
            _ = tokio::time::sleep(playback) => Ok(SpeechOutcome::Completed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn playback_completes() {
        let voice = ConsoleVoice::new(Duration::from_millis(10));
        let outcome = voice.speak("hello", CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, SpeechOutcome::Completed);
        assert_eq!(voice.spoken(), vec!["hello".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_playback_short() {
        let voice = std::sync::Arc::new(ConsoleVoice::new(Duration::from_secs(1)));
        let token = CancellationToken::new();
        let task = {
            let voice = voice.clone();
            let token = token.clone();
            tokio::spawn(async move { voice.speak("a very long story", token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        assert_eq!(task.await.unwrap().unwrap(), SpeechOutcome::Cancelled);
    }
}
