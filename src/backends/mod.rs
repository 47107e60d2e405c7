//! Inference capabilities a session depends on
//!
//! The session core only sees these traits. Concrete clients live in the
//! submodules; tests substitute scripted doubles.

mod detector;
mod llm;
pub mod retry;
mod stt;
mod trigger;
mod tts;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::audio::AudioChunk;
use crate::session::VadEventSender;
use crate::{Error, Result};

pub use detector::{EnergyDetector, EnergyDetectorProvider, VadSettings};
pub use llm::{Completion, CompletionClient, LineDecoder, parse_completion_line};
pub use retry::RetryPolicy;
pub use stt::{HttpTranscriber, SttProvider};
pub use trigger::{EnergyTrigger, WakeWordTrigger};
pub use tts::{HttpSynthesizer, TtsProvider};

/// Incremental reply text, lazy and finite
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens one voice activity detector per session
#[async_trait]
pub trait DetectorProvider: Send + Sync {
    /// Open a detector that reports activity changes on `events`
    async fn open(&self, events: VadEventSender) -> Result<Arc<dyn VoiceActivityDetector>>;
}

/// A per-session voice activity detector
///
/// Events are delivered asynchronously through the sender handed to
/// [`DetectorProvider::open`], never as return values.
#[async_trait]
pub trait VoiceActivityDetector: Send + Sync {
    /// Feed one frame of audio
    async fn process(&self, chunk: &AudioChunk) -> Result<()>;

    /// Whether speech is currently active
    fn is_active(&self) -> bool;

    /// Forget any partial activity
    async fn reset(&self) -> Result<()>;
}

/// Decides whether captured audio contains the wake trigger
#[async_trait]
pub trait TriggerDetector: Send + Sync {
    async fn is_triggered(&self, window: &[AudioChunk], cancel: &CancellationToken)
    -> Result<bool>;
}

/// Speech to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, chunks: &[AudioChunk], cancel: &CancellationToken)
    -> Result<String>;
}

/// Streaming text generation
#[async_trait]
pub trait Generator: Send + Sync {
    /// Open a reply stream for `prompt`
    ///
    /// The stream ends when the reply is complete. Dropping it abandons the
    /// request.
    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<FragmentStream>;
}

/// Text to speech, one call per sentence
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, sentence: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;
}

/// The capabilities available to sessions
///
/// A `None` capability is reported to the client as unavailable when it
/// would have been needed.
#[derive(Clone, Default)]
pub struct Backends {
    pub detector: Option<Arc<dyn DetectorProvider>>,
    pub trigger: Option<Arc<dyn TriggerDetector>>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub generator: Option<Arc<dyn Generator>>,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
}

impl Backends {
    /// Names of the configured capabilities
    #[must_use]
    pub fn available(&self) -> Vec<&'static str> {
        [
            ("detector", self.detector.is_some()),
            ("trigger", self.trigger.is_some()),
            ("transcriber", self.transcriber.is_some()),
            ("generator", self.generator.is_some()),
            ("synthesizer", self.synthesizer.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect()
    }

    /// The transcriber, if one is configured
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] naming the STT service otherwise
    pub fn require_transcriber(&self) -> Result<Arc<dyn Transcriber>> {
        self.transcriber
            .clone()
            .ok_or(Error::Unavailable("STT service"))
    }

    /// The generator, if one is configured
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] naming the LLM service otherwise
    pub fn require_generator(&self) -> Result<Arc<dyn Generator>> {
        self.generator
            .clone()
            .ok_or(Error::Unavailable("LLM service"))
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("available", &self.available())
            .finish()
    }
}

/// Parse a service base URL so that relative endpoints join under its path
///
/// # Errors
///
/// Returns [`Error::Config`] if `raw` is not an absolute URL
pub fn base_url(raw: &str) -> Result<Url> {
    let mut url =
        Url::parse(raw).map_err(|e| Error::Config(format!("invalid service URL {raw:?}: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::Config(format!("invalid endpoint {path:?}: {e}")))
}

/// Run a backend call racing `cancel` and an optional deadline
///
/// # Errors
///
/// Returns [`Error::Cancelled`] if `cancel` fires first, [`Error::Timeout`]
/// if the deadline passes, otherwise the call's own result
pub async fn call_guarded<T, F>(
    label: &'static str,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let bounded = async {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| Error::Timeout(label))?,
            None => call.await,
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = bounded => result,
    }
}
