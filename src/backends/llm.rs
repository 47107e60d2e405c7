//! Streaming text completion over HTTP
//!
//! Talks to any server exposing `POST /v1/completions` with `"stream": true`.
//! Both SSE (`data: {...}` lines ending in `data: [DONE]`) and bare NDJSON
//! (`{"response": "...", "done": false}` per line) bodies are understood.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::retry::{RetryPolicy, ensure_success};
use super::{FragmentStream, Generator, base_url, endpoint};
use crate::{Error, Result};

/// Fragments buffered between the body reader and the pipeline
const FRAGMENT_BUFFER: usize = 32;

/// One decoded line of a completion stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// The server signalled the end of the reply
    pub done: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one line of a streaming completion body
///
/// Returns `Ok(None)` for blank lines and SSE comments.
///
/// # Errors
///
/// Returns [`Error::Generation`] if the line is not valid JSON
pub fn parse_completion_line(line: &str) -> Result<Option<Completion>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let payload = line.strip_prefix("data:").map_or(line, str::trim_start);
    if payload == "[DONE]" {
        return Ok(Some(Completion {
            text: String::new(),
            done: true,
        }));
    }

    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| Error::Generation(format!("malformed stream line: {e}")))?;

    if let Some(text) = chunk.response {
        return Ok(Some(Completion {
            text,
            done: chunk.done,
        }));
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(Some(Completion {
            text: String::new(),
            done: chunk.done,
        }));
    };
    let text = choice
        .text
        .or_else(|| choice.delta.and_then(|d| d.content))
        .unwrap_or_default();

    Ok(Some(Completion {
        text,
        done: chunk.done || choice.finish_reason.is_some(),
    }))
}

/// Splits a byte stream into lines across chunk boundaries
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = raw.strip_suffix(b"\n").unwrap_or(&raw);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
        }
        lines
    }

    /// The unterminated tail, if any
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = String::from_utf8_lossy(&rest);
        let rest = rest.trim_end_matches('\r');
        (!rest.trim().is_empty()).then(|| rest.to_string())
    }
}

/// Streams replies from a `/v1/completions` endpoint
pub struct CompletionClient {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    max_tokens: u32,
    api_key: Option<SecretString>,
    retry: RetryPolicy,
}

impl CompletionClient {
    /// Create a client for the service at `base`
    ///
    /// # Errors
    ///
    /// Returns error if `base` is not a valid URL
    pub fn new(
        base: &str,
        model: impl Into<String>,
        max_tokens: u32,
        api_key: Option<SecretString>,
    ) -> Result<Self> {
        let base = base_url(base)?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: endpoint(&base, "v1/completions")?,
            model: model.into(),
            max_tokens,
            api_key,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy used to open the stream
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn open(&self, prompt: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct CompletionRequest<'a> {
            model: &'a str,
            prompt: &'a str,
            stream: bool,
            max_tokens: u32,
        }

        let request = CompletionRequest {
            model: &self.model,
            prompt,
            stream: true,
            max_tokens: self.max_tokens,
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        ensure_success("LLM", builder.send().await?).await
    }
}

impl std::fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Generator for CompletionClient {
    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<FragmentStream> {
        let response = self
            .retry
            .run("LLM", cancel, move || async move { self.open(prompt).await })
            .await?;
        tracing::debug!(model = %self.model, "completion stream opened");

        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        tokio::spawn(forward_fragments(response.bytes_stream(), tx, cancel.clone()));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Decode the response body into fragments until it ends, fails, or nobody
/// is listening
async fn forward_fragments<S, B>(
    body: S,
    tx: mpsc::Sender<Result<String>>,
    cancel: CancellationToken,
) where
    S: Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = LineDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tx.closed() => return,
            next = body.next() => next,
        };

        let (lines, ended) = match next {
            Some(Ok(bytes)) => (decoder.push(bytes.as_ref()), false),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "completion stream failed");
                let _ = tx.send(Err(e.into())).await;
                return;
            }
            None => (decoder.finish().into_iter().collect(), true),
        };

        for line in lines {
            match parse_completion_line(&line) {
                Ok(Some(completion)) => {
                    if !completion.text.is_empty() && tx.send(Ok(completion.text)).await.is_err() {
                        return;
                    }
                    if completion.done {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        if ended {
            return;
        }
    }
}
