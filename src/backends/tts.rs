//! Text-to-speech over HTTP

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::retry::{RetryPolicy, ensure_success};
use super::{Synthesizer, base_url, endpoint};
use crate::Result;

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// `POST /v1/audio/speech`
    #[default]
    #[value(name = "openai")]
    OpenAi,
    /// `POST /v1/text-to-speech/{voice}`
    #[value(name = "elevenlabs")]
    ElevenLabs,
}

/// Synthesizes speech through an HTTP service
pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<SecretString>,
    voice: String,
    model: String,
    speed: f32,
    provider: TtsProvider,
    retry: RetryPolicy,
}

impl HttpSynthesizer {
    /// Create a synthesizer for the service at `base`
    ///
    /// # Errors
    ///
    /// Returns error if `base` is not a valid URL
    pub fn new(
        provider: TtsProvider,
        base: &str,
        voice: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self> {
        let base = base_url(base)?;
        let voice = voice.into();
        let endpoint = match provider {
            TtsProvider::OpenAi => endpoint(&base, "v1/audio/speech")?,
            TtsProvider::ElevenLabs => endpoint(&base, &format!("v1/text-to-speech/{voice}"))?,
        };

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            voice,
            model: model.into(),
            speed: 1.0,
            provider,
            retry: RetryPolicy::default(),
        })
    }

    /// Speaking speed multiplier (OpenAI-compatible services only)
    #[must_use]
    pub const fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Synthesize using an OpenAI-compatible endpoint
    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = ensure_success("TTS", builder.send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Synthesize using ElevenLabs
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("xi-api-key", key.expose_secret());
        }

        let response = ensure_success("TTS", builder.send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

impl std::fmt::Debug for HttpSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSynthesizer")
            .field("endpoint", &self.endpoint.as_str())
            .field("provider", &self.provider)
            .field("voice", &self.voice)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, sentence: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let audio = self
            .retry
            .run("TTS", cancel, move || async move {
                match self.provider {
                    TtsProvider::OpenAi => self.synthesize_openai(sentence).await,
                    TtsProvider::ElevenLabs => self.synthesize_elevenlabs(sentence).await,
                }
            })
            .await?;

        tracing::debug!(chars = sentence.len(), audio_bytes = audio.len(), "synthesized sentence");
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevenlabs_endpoint_names_the_voice() {
        let tts = HttpSynthesizer::new(
            TtsProvider::ElevenLabs,
            "https://api.elevenlabs.io",
            "21m00Tcm4TlvDq8ikWAM",
            "eleven_monolingual_v1",
            None,
        )
        .unwrap();
        assert_eq!(
            tts.endpoint.as_str(),
            "https://api.elevenlabs.io/v1/text-to-speech/21m00Tcm4TlvDq8ikWAM"
        );
    }

    #[test]
    fn openai_endpoint() {
        let tts = HttpSynthesizer::new(TtsProvider::OpenAi, "http://tts:8880/", "alloy", "tts-1", None)
            .unwrap()
            .with_speed(1.2);
        assert_eq!(tts.endpoint.as_str(), "http://tts:8880/v1/audio/speech");
        assert!((tts.speed - 1.2).abs() < f32::EPSILON);
    }
}
