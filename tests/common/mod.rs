//! Shared test utilities: scripted backends and session helpers

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use murmur_gateway::audio::AudioChunk;
use murmur_gateway::backends::{
    Backends, DetectorProvider, FragmentStream, Generator, Synthesizer, Transcriber,
    TriggerDetector, VoiceActivityDetector,
};
use murmur_gateway::protocol::{OutboundFrame, ServerMessage};
use murmur_gateway::session::{Outbound, SessionSettings, VadEvent, VadEventSender};
use murmur_gateway::{Error, Result, Session, State};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a test waits for an expected frame
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a test waits to be sure nothing arrives
pub const QUIET_PERIOD: Duration = Duration::from_millis(150);

/// Detector that never reports on its own and counts what it sees
#[derive(Default)]
pub struct CountingDetector {
    pub frames: AtomicUsize,
    pub resets: AtomicUsize,
}

#[async_trait]
impl VoiceActivityDetector for CountingDetector {
    async fn process(&self, _chunk: &AudioChunk) -> Result<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        false
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared [`CountingDetector`]
#[derive(Default)]
pub struct CountingDetectorProvider {
    pub detector: Arc<CountingDetector>,
}

#[async_trait]
impl DetectorProvider for CountingDetectorProvider {
    async fn open(&self, _events: VadEventSender) -> Result<Arc<dyn VoiceActivityDetector>> {
        Ok(self.detector.clone())
    }
}

/// Trigger with a fixed answer
pub struct FixedTrigger {
    pub answer: bool,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl FixedTrigger {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer only after `delay`, ignoring cancellation
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl TriggerDetector for FixedTrigger {
    async fn is_triggered(&self, _window: &[AudioChunk], _cancel: &CancellationToken) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.answer)
    }
}

/// Transcriber that records every call
pub struct RecordingTranscriber {
    reply: std::result::Result<String, String>,
    delay: Option<Duration>,
    pub calls: Mutex<Vec<Vec<AudioChunk>>>,
}

impl RecordingTranscriber {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            delay: None,
            calls: Mutex::default(),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            delay: None,
            calls: Mutex::default(),
        }
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Vec<AudioChunk>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for RecordingTranscriber {
    async fn transcribe(&self, chunks: &[AudioChunk], _cancel: &CancellationToken) -> Result<String> {
        self.calls.lock().unwrap().push(chunks.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone().map_err(Error::Transcription)
    }
}

/// How a [`ScriptedGenerator`] behaves
pub enum Script {
    /// Yield these fragments, then end
    Fragments(Vec<&'static str>),
    /// Yield these fragments, then never end
    Stall(Vec<&'static str>),
    /// Yield these fragments, then fail
    FailAfter(Vec<&'static str>),
    /// Refuse to open the stream
    FailOpen,
}

pub struct ScriptedGenerator {
    script: Script,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            prompts: Mutex::default(),
        }
    }
}

fn fragments(list: &[&'static str]) -> Vec<Result<String>> {
    list.iter().map(|f| Ok((*f).to_string())).collect()
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _cancel: &CancellationToken) -> Result<FragmentStream> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let stream: FragmentStream = match &self.script {
            Script::Fragments(list) => Box::pin(futures::stream::iter(fragments(list))),
            Script::Stall(list) => {
                Box::pin(futures::stream::iter(fragments(list)).chain(futures::stream::pending()))
            }
            Script::FailAfter(list) => {
                let mut items = fragments(list);
                items.push(Err(Error::Generation("stream dropped".to_string())));
                Box::pin(futures::stream::iter(items))
            }
            Script::FailOpen => return Err(Error::Generation("model not loaded".to_string())),
        };
        Ok(stream)
    }
}

/// Synthesizer returning each sentence's bytes as its audio
#[derive(Default)]
pub struct EchoSynthesizer {
    /// Sentences containing this text fail
    pub fail_on: Option<&'static str>,
    /// Sentences containing the text take that long to synthesize
    pub delays: Vec<(&'static str, Duration)>,
    pub calls: Mutex<Vec<String>>,
}

impl EchoSynthesizer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    async fn synthesize(&self, sentence: &str, _cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(sentence.to_string());
        let delay = self
            .delays
            .iter()
            .find(|(needle, _)| sentence.contains(needle))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on.is_some_and(|needle| sentence.contains(needle)) {
            return Err(Error::Synthesis("voice unavailable".to_string()));
        }
        Ok(sentence.as_bytes().to_vec())
    }
}

/// Settings with a short call deadline
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        call_timeout: Some(Duration::from_secs(5)),
        ..SessionSettings::default()
    }
}

/// Start a session and consume its initial `IDLE`/`Ready`
pub async fn start(
    backends: Backends,
    settings: SessionSettings,
) -> (Arc<Session>, mpsc::Receiver<OutboundFrame>) {
    let (outbound, mut rx) = Outbound::channel(64);
    let session = Session::start(backends, settings, outbound).await;
    expect_status(&mut rx, State::Idle, "Ready").await;
    (session, rx)
}

/// A distinct audio frame
pub fn chunk(n: u8) -> AudioChunk {
    AudioChunk::from(vec![n; 320])
}

/// Wait for the next frame
pub async fn next_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> OutboundFrame {
    tokio::time::timeout(FRAME_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbound channel closed")
}

/// Wait for the next frame and check it is the given status
pub async fn expect_status(rx: &mut mpsc::Receiver<OutboundFrame>, status: State, detail: &str) {
    let frame = next_frame(rx).await;
    assert_eq!(
        frame,
        OutboundFrame::Message(ServerMessage::status(status, detail)),
        "unexpected frame"
    );
}

/// Assert nothing is sent for a while
pub async fn expect_quiet(rx: &mut mpsc::Receiver<OutboundFrame>) {
    if let Ok(Some(frame)) = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("unexpected frame: {frame:?}");
    }
}

/// Collect frames up to and including the next `IDLE` status
pub async fn collect_until_settled(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(rx).await;
        let settled = matches!(
            &frame,
            OutboundFrame::Message(ServerMessage::Status {
                status: State::Idle,
                ..
            })
        );
        frames.push(frame);
        if settled {
            return frames;
        }
    }
}

/// Poll until the session reaches `state`
pub async fn wait_for_state(session: &Session, state: State) {
    tokio::time::timeout(FRAME_TIMEOUT, async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session stuck in {} waiting for {state}", session.state()));
}

/// Poll until `done` holds
pub async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    tokio::time::timeout(FRAME_TIMEOUT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Deliver a detector event as the session's detector would
pub fn emit(session: &Session, event: VadEvent) {
    assert!(session.event_sender().emit(event), "event not accepted");
}

/// Trigger a capture and wait until the session is listening
pub async fn trigger(session: &Session, rx: &mut mpsc::Receiver<OutboundFrame>) {
    emit(session, VadEvent::start());
    expect_status(rx, State::Triggered, "Listening to you...").await;
}

/// The text frames' reply fragments, in order
pub fn responses(frames: &[OutboundFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            OutboundFrame::Message(ServerMessage::Response { text }) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// The binary frames decoded as UTF-8, in order
pub fn audio(frames: &[OutboundFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            OutboundFrame::Audio(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            OutboundFrame::Message(_) => None,
        })
        .collect()
}
