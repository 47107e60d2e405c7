//! Speech-to-text over HTTP

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::retry::{RetryPolicy, ensure_success};
use super::{Transcriber, base_url, endpoint};
use crate::audio::{self, AudioChunk};
use crate::{Error, Result};

/// Response from an OpenAI-compatible transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// `POST /v1/audio/transcriptions` (OpenAI, whisper.cpp server, faster-whisper)
    #[default]
    Whisper,
    /// `POST /v1/listen`
    Deepgram,
}

/// Transcribes captured audio through an HTTP service
pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<SecretString>,
    model: String,
    provider: SttProvider,
    sample_rate: u32,
    retry: RetryPolicy,
}

impl HttpTranscriber {
    /// Create a transcriber for the service at `base`
    ///
    /// # Errors
    ///
    /// Returns error if `base` is not a valid URL
    pub fn new(
        provider: SttProvider,
        base: &str,
        model: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self> {
        let base = base_url(base)?;
        let endpoint = match provider {
            SttProvider::Whisper => endpoint(&base, "v1/audio/transcriptions")?,
            SttProvider::Deepgram => endpoint(&base, "v1/listen")?,
        };

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model: model.into(),
            provider,
            sample_rate: audio::SAMPLE_RATE,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sample rate of the PCM audio this transcriber receives
    #[must_use]
    pub const fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Transcribe using an OpenAI-compatible endpoint
    async fn transcribe_whisper(&self, wav: &[u8]) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Transcription(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let mut request = self.client.post(self.endpoint.clone()).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = ensure_success("STT", request.send().await?).await?;
        let result: WhisperResponse = response.json().await?;
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, wav: &[u8]) -> Result<String> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .query(&[("model", self.model.as_str()), ("punctuate", "true")])
            .header("Content-Type", "audio/wav")
            .body(wav.to_vec());
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Token {}", key.expose_secret()));
        }

        let response = ensure_success("STT", request.send().await?).await?;
        let result: DeepgramResponse = response.json().await?;

        Ok(result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for HttpTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTranscriber")
            .field("endpoint", &self.endpoint.as_str())
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, chunks: &[AudioChunk], cancel: &CancellationToken) -> Result<String> {
        let wav = audio::chunks_to_wav(chunks, self.sample_rate)?;
        tracing::debug!(audio_bytes = wav.len(), provider = ?self.provider, "starting transcription");

        let wav = wav.as_slice();
        let transcript = self
            .retry
            .run("STT", cancel, move || async move {
                match self.provider {
                    SttProvider::Whisper => self.transcribe_whisper(wav).await,
                    SttProvider::Deepgram => self.transcribe_deepgram(wav).await,
                }
            })
            .await?;

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_follow_provider() {
        let whisper = HttpTranscriber::new(SttProvider::Whisper, "http://stt:8000", "whisper-1", None)
            .unwrap();
        assert_eq!(whisper.endpoint.as_str(), "http://stt:8000/v1/audio/transcriptions");

        let deepgram =
            HttpTranscriber::new(SttProvider::Deepgram, "https://api.deepgram.com", "nova-2", None)
                .unwrap();
        assert_eq!(deepgram.endpoint.as_str(), "https://api.deepgram.com/v1/listen");
    }

    #[test]
    fn invalid_base_is_a_config_error() {
        let err = tokio_test::assert_err!(HttpTranscriber::new(
            SttProvider::Whisper,
            "::",
            "whisper-1",
            None
        ));
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn deepgram_transcript_is_extracted() {
        let body = r#"{"results":{"channels":[{"alternatives":[{"transcript":"hello there"}]}]}}"#;
        let parsed: DeepgramResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.results.channels[0].alternatives[0].transcript, "hello there");
    }
}
