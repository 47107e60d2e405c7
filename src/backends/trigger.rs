//! Wake trigger detection

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Transcriber, TriggerDetector};
use crate::audio::{self, AudioChunk};
use crate::{Error, Result};

/// Fires on any sufficiently loud window
///
/// Useful for push-to-talk style clients and for testing without a wake
/// word model.
#[derive(Debug, Clone)]
pub struct EnergyTrigger {
    threshold: f32,
}

impl EnergyTrigger {
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl TriggerDetector for EnergyTrigger {
    async fn is_triggered(&self, window: &[AudioChunk], _cancel: &CancellationToken) -> Result<bool> {
        let samples: Vec<f32> = window.iter().flat_map(AudioChunk::samples).collect();
        let energy = audio::rms_energy(&samples);
        tracing::trace!(energy, threshold = self.threshold, "trigger energy");
        Ok(energy > self.threshold)
    }
}

/// Fires when the transcribed window contains a wake word
pub struct WakeWordTrigger {
    transcriber: Arc<dyn Transcriber>,
    wake_words: Vec<String>,
}

impl WakeWordTrigger {
    /// Create a trigger for the given wake words (e.g. "hey murmur")
    #[must_use]
    pub fn new(transcriber: Arc<dyn Transcriber>, wake_words: Vec<String>) -> Self {
        let wake_words: Vec<String> = wake_words
            .into_iter()
            .map(|w| w.to_lowercase().trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();

        tracing::debug!(wake_words = ?wake_words, "wake word trigger initialized");
        Self {
            transcriber,
            wake_words,
        }
    }

    /// Check if transcribed text contains a wake word
    #[must_use]
    pub fn matches(&self, transcript: &str) -> bool {
        let normalized = transcript.to_lowercase();
        self.wake_words.iter().any(|wake_word| {
            let found = normalized.contains(wake_word.as_str());
            if found {
                tracing::info!(wake_word, transcript, "wake word detected");
            }
            found
        })
    }

    /// Configured wake words, normalized
    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }
}

impl std::fmt::Debug for WakeWordTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeWordTrigger")
            .field("wake_words", &self.wake_words)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TriggerDetector for WakeWordTrigger {
    async fn is_triggered(&self, window: &[AudioChunk], cancel: &CancellationToken) -> Result<bool> {
        if window.is_empty() {
            return Ok(false);
        }
        let transcript = self
            .transcriber
            .transcribe(window, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                e => Error::Trigger(format!("wake word transcription failed: {e}")),
            })?;
        Ok(self.matches(&transcript))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    struct Broken;

    #[async_trait]
    impl Transcriber for Broken {
        async fn transcribe(&self, _: &[AudioChunk], cancel: &CancellationToken) -> Result<String> {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            Err(Error::Transcription("model offline".to_string()))
        }
    }

    #[async_trait]
    impl Transcriber for Fixed {
        async fn transcribe(&self, _: &[AudioChunk], _: &CancellationToken) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn loud() -> AudioChunk {
        AudioChunk::from(audio::f32_to_pcm16(&[0.5; 160]))
    }

    #[tokio::test]
    async fn energy_trigger_needs_loud_audio() {
        let trigger = EnergyTrigger::new(0.1);
        let token = CancellationToken::new();
        let quiet = AudioChunk::from(audio::f32_to_pcm16(&[0.0; 160]));

        assert!(!trigger.is_triggered(&[quiet], &token).await.unwrap());
        assert!(trigger.is_triggered(&[loud()], &token).await.unwrap());
        assert!(!trigger.is_triggered(&[], &token).await.unwrap());
    }

    #[tokio::test]
    async fn wake_word_matches_case_insensitively() {
        let trigger = WakeWordTrigger::new(Arc::new(Fixed("Hey Murmur, what's up?")), vec![
            "  hey murmur ".to_string(),
        ]);
        let token = CancellationToken::new();
        assert_eq!(trigger.wake_words(), ["hey murmur"]);
        assert!(trigger.is_triggered(&[loud()], &token).await.unwrap());
        assert!(!trigger.is_triggered(&[], &token).await.unwrap());
    }

    #[tokio::test]
    async fn other_speech_does_not_trigger() {
        let trigger = WakeWordTrigger::new(Arc::new(Fixed("hello world")), vec![
            "hey murmur".to_string(),
        ]);
        let token = CancellationToken::new();
        assert!(!trigger.is_triggered(&[loud()], &token).await.unwrap());
    }

    #[tokio::test]
    async fn transcription_failure_is_a_trigger_error() {
        let trigger = WakeWordTrigger::new(Arc::new(Broken), vec!["hey murmur".to_string()]);
        let token = CancellationToken::new();
        let err = trigger.is_triggered(&[loud()], &token).await.unwrap_err();
        assert!(matches!(err, Error::Trigger(_)));

        token.cancel();
        let err = trigger.is_triggered(&[loud()], &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
