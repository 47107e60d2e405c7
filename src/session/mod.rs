//! Per-connection voice session
//!
//! A [`Session`] owns the state machine for one client. Audio frames arrive
//! through [`Session::handle_audio`], detector events are consumed by a
//! background event loop, and each captured utterance is answered by a
//! response pipeline running as its own task.

mod buffer;
mod cancel;
mod events;
mod outbound;
mod pipeline;
mod registry;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{self, AudioChunk};
use crate::backends::{Backends, VoiceActivityDetector};
use crate::protocol::{ClientCommand, ServerMessage};

pub use buffer::{AudioBuffer, AudioWindow, Overflow};
pub use cancel::{CancelHandle, CancelRegistry, PROCESSING};
pub use events::{EVENT_CHANNEL_CAPACITY, TRIGGER_CHECK, VadEvent, VadEventKind, VadEventSender};
pub use outbound::Outbound;
pub use pipeline::SentenceSegmenter;
pub use registry::{SessionRegistry, SessionSummary};
pub use state::State;

/// Tunables shared by every session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Sample rate of client audio
    pub sample_rate: u32,
    /// Length of the rolling window handed to the trigger detector
    pub preroll_ms: u64,
    /// Cap on one captured utterance; `0` disables the cap
    pub max_buffered_ms: u64,
    /// Deadline for each backend call
    pub call_timeout: Option<Duration>,
    /// Synthesized sentences allowed to wait for playback
    pub max_pending_synthesis: usize,
    /// Capacity of the detector event channel
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sample_rate: audio::SAMPLE_RATE,
            preroll_ms: 1500,
            max_buffered_ms: 30_000,
            call_timeout: Some(Duration::from_secs(30)),
            max_pending_synthesis: 4,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Server-side state of one client connection
pub struct Session {
    id: Uuid,
    state: Mutex<State>,
    buffer: AudioBuffer,
    preroll: AudioWindow,
    voice_active: AtomicBool,
    triggered: AtomicBool,
    transcript: Mutex<Option<String>>,
    cancels: CancelRegistry,
    outbound: Outbound,
    backends: Backends,
    settings: SessionSettings,
    root: CancellationToken,
    events: VadEventSender,
    detector: Option<Arc<dyn VoiceActivityDetector>>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Create a session, open its detector and start its event loop
    ///
    /// A detector that fails to open is logged and treated as absent.
    pub async fn start(
        backends: Backends,
        settings: SessionSettings,
        outbound: Outbound,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let (event_tx, event_rx) = VadEventSender::channel(settings.event_capacity);

        let detector = match &backends.detector {
            Some(provider) => match provider.open(event_tx.clone()).await {
                Ok(detector) => Some(detector),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "voice activity detector unavailable");
                    None
                }
            },
            None => None,
        };

        let max_bytes = (settings.max_buffered_ms > 0)
            .then(|| audio::bytes_for_duration(settings.max_buffered_ms, settings.sample_rate));
        let preroll_bytes = audio::bytes_for_duration(settings.preroll_ms, settings.sample_rate);
        let root = CancellationToken::new();

        let session = Arc::new(Self {
            id,
            state: Mutex::new(State::Idle),
            buffer: AudioBuffer::with_limit(max_bytes),
            preroll: AudioWindow::new(preroll_bytes),
            voice_active: AtomicBool::new(false),
            triggered: AtomicBool::new(false),
            transcript: Mutex::new(None),
            cancels: CancelRegistry::new(root.clone()),
            outbound,
            backends,
            settings,
            root,
            events: event_tx,
            detector,
            pipeline: Mutex::new(None),
            event_loop: Mutex::new(None),
        });

        let event_loop = tokio::spawn(events::run(Arc::clone(&session), event_rx));
        *lock(&session.event_loop) = Some(event_loop);

        tracing::info!(session_id = %id, "session started");
        session.send_status(State::Idle, "Ready").await;
        session
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    /// Whether the detector last reported speech
    #[must_use]
    pub fn is_voice_active(&self) -> bool {
        self.voice_active.load(Ordering::Acquire)
    }

    /// Whether the wake trigger fired for the utterance being captured
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Last finalized transcript
    #[must_use]
    pub fn transcript(&self) -> Option<String> {
        lock(&self.transcript).clone()
    }

    /// Captured utterance audio, in arrival order
    #[must_use]
    pub const fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }

    #[must_use]
    pub const fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Sender for detector events, for integrations that run outside the
    /// session's own detector
    #[must_use]
    pub fn event_sender(&self) -> VadEventSender {
        self.events.clone()
    }

    /// Whether a response pipeline task is still running
    #[must_use]
    pub fn is_responding(&self) -> bool {
        lock(&self.pipeline)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Attempt a transition, rejecting edges outside the table
    pub fn transition(&self, next: State) -> bool {
        let mut state = lock(&self.state);
        self.apply(&mut state, next)
    }

    /// Transition only if the current state is `expected`
    pub fn compare_and_set(&self, expected: State, next: State) -> bool {
        let mut state = lock(&self.state);
        *state == expected && self.apply(&mut state, next)
    }

    /// Transition unless `token` has fired
    ///
    /// The check happens under the state lock, so a cancelled operation can
    /// never overwrite the state written by the reset that followed it.
    pub fn transition_unless_cancelled(&self, token: &CancellationToken, next: State) -> bool {
        let mut state = lock(&self.state);
        !token.is_cancelled() && self.apply(&mut state, next)
    }

    /// [`Session::compare_and_set`] that refuses once `token` has fired
    pub(super) fn compare_and_set_unless_cancelled(
        &self,
        token: &CancellationToken,
        expected: State,
        next: State,
    ) -> bool {
        let mut state = lock(&self.state);
        !token.is_cancelled() && *state == expected && self.apply(&mut state, next)
    }

    fn apply(&self, state: &mut State, next: State) -> bool {
        if !state.can_transition_to(next) {
            tracing::warn!(session_id = %self.id, from = %state, to = %next, "rejected transition");
            return false;
        }
        if *state != next {
            tracing::debug!(session_id = %self.id, from = %state, to = %next, "state transition");
        }
        *state = next;
        true
    }

    /// Accept one frame from the client
    ///
    /// The frame always reaches the pre-roll window and the detector. It is
    /// captured into the buffer only while triggered, before the detector
    /// sees it, so an end event can never overtake the frame that caused it.
    pub async fn handle_audio(&self, chunk: AudioChunk) {
        if chunk.is_empty() {
            return;
        }
        self.preroll.push(chunk.clone());

        // Appending under the state lock keeps a frame from landing after
        // the capture has been handed to the pipeline
        let captured = {
            let state = lock(&self.state);
            (*state == State::Triggered).then(|| self.buffer.append(chunk.clone()))
        };
        if let Some(Err(overflow)) = captured {
            tracing::warn!(
                session_id = %self.id,
                buffered = overflow.buffered,
                limit = overflow.limit,
                "utterance exceeds buffer cap"
            );
            self.buffer.clear();
            self.triggered.store(false, Ordering::Release);
            if self.compare_and_set(State::Triggered, State::Error) {
                self.send_status(State::Error, "Buffer overflow").await;
                if self.compare_and_set(State::Error, State::Idle) {
                    self.send_status(State::Idle, "Ready").await;
                }
            }
        }

        if let Some(detector) = &self.detector {
            if let Err(e) = detector.process(&chunk).await {
                tracing::warn!(session_id = %self.id, error = %e, "detector rejected audio");
            }
        }
    }

    /// Parse and apply a text frame; unknown commands are logged and ignored
    pub async fn handle_text(&self, text: &str) {
        match ClientCommand::parse(text) {
            Ok(command) => self.handle_command(command).await,
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "ignoring malformed command"),
        }
    }

    /// Apply a control command
    pub async fn handle_command(&self, command: ClientCommand) {
        tracing::info!(session_id = %self.id, ?command, "client command");
        match command {
            ClientCommand::Reset => self.reset().await,
            ClientCommand::Stop => self.stop().await,
        }
    }

    /// Return to idle and forget the current utterance
    ///
    /// A running reply and a pending trigger check are cancelled.
    /// Idempotent: always announces `IDLE`/`Ready`.
    pub async fn reset(&self) {
        let replying = self.cancels.cancel(PROCESSING);
        let checking = self.cancels.cancel(TRIGGER_CHECK);
        if replying || checking {
            self.outbound.barrier().await;
        }
        if !self.transition(State::Idle) {
            return;
        }
        *lock(&self.transcript) = None;
        self.voice_active.store(false, Ordering::Release);
        self.triggered.store(false, Ordering::Release);
        self.buffer.clear();
        self.preroll.clear();

        if let Some(detector) = &self.detector {
            if let Err(e) = detector.reset().await {
                tracing::warn!(session_id = %self.id, error = %e, "detector reset failed");
            }
        }
        self.send_status(State::Idle, "Ready").await;
    }

    /// Cancel all in-flight work, then reset
    ///
    /// When this returns, no frame from the cancelled work can still reach
    /// the client.
    pub async fn stop(&self) {
        let cancelled = self.cancels.cancel_all();
        self.outbound.barrier().await;
        tracing::info!(session_id = %self.id, cancelled, "stopped in-flight work");
        self.reset().await;
    }

    /// Tear the session down after the transport closed
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn close(&self) {
        {
            let mut state = lock(&self.state);
            if *state == State::Disconnected {
                return;
            }
            self.apply(&mut state, State::Disconnected);
        }
        self.root.cancel();
        self.cancels.cancel_all();

        let pipeline = lock(&self.pipeline).take();
        let event_loop = lock(&self.event_loop).take();
        for task in [pipeline, event_loop].into_iter().flatten() {
            if let Err(e) = task.await {
                tracing::debug!(session_id = %self.id, error = %e, "session task ended abnormally");
            }
        }
        tracing::info!(session_id = %self.id, "session closed");
    }

    /// Token fired when the session is torn down
    #[must_use]
    pub const fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    async fn send_status(&self, state: State, detail: &str) {
        if let Err(e) = self.outbound.send(ServerMessage::status(state, detail)).await {
            tracing::debug!(session_id = %self.id, error = %e, "status not delivered");
        }
    }

    fn set_transcript(&self, transcript: String) {
        *lock(&self.transcript) = Some(transcript);
    }

    fn pipeline_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        lock(&self.pipeline)
    }

    /// Report a pipeline failure and return to idle, unless cancelled
    async fn fail_scoped(&self, token: &CancellationToken, detail: &str) {
        tracing::warn!(session_id = %self.id, detail, "reply failed");
        if !self.transition_unless_cancelled(token, State::Error) {
            return;
        }
        if let Err(e) = self
            .outbound
            .send_scoped(token, ServerMessage::status(State::Error, detail))
            .await
        {
            tracing::debug!(session_id = %self.id, error = %e, "error status not delivered");
        }
        if !self.transition_unless_cancelled(token, State::Idle) {
            return;
        }
        if let Err(e) = self
            .outbound
            .send_scoped(token, ServerMessage::status(State::Idle, "Ready"))
            .await
        {
            tracing::debug!(session_id = %self.id, error = %e, "idle status not delivered");
        }
    }
}
