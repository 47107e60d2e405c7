//! Voice activity events and the per-session event loop

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::cancel::CancelHandle;
use super::{Session, State, pipeline};
use crate::backends::call_guarded;
use crate::protocol::ServerMessage;

/// Default capacity of a session's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Cancel registry key for an in-flight trigger check
pub const TRIGGER_CHECK: &str = "vadTrigger";

/// Kind of voice activity change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEventKind {
    Start,
    Continue,
    End,
}

/// One notification from the activity detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VadEvent {
    pub kind: VadEventKind,
    /// Optional diagnostic text from the detector
    pub message: Option<String>,
}

impl VadEvent {
    #[must_use]
    pub const fn new(kind: VadEventKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    #[must_use]
    pub const fn start() -> Self {
        Self::new(VadEventKind::Start)
    }

    #[must_use]
    pub const fn progress() -> Self {
        Self::new(VadEventKind::Continue)
    }

    #[must_use]
    pub const fn end() -> Self {
        Self::new(VadEventKind::End)
    }

    /// Attach a diagnostic message
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Producer half of a session's event channel
///
/// Never blocks: when the consumer falls behind, the newest event is dropped
/// and logged so the detector can keep up with incoming audio.
#[derive(Debug, Clone)]
pub struct VadEventSender {
    tx: mpsc::Sender<VadEvent>,
}

impl VadEventSender {
    /// Create a bounded event channel
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<VadEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Deliver an event without waiting
    ///
    /// Returns false if the event was dropped.
    pub fn emit(&self, event: VadEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(kind = ?event.kind, "event channel full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("event channel closed");
                false
            }
        }
    }

    /// Whether the consumer has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consume events in arrival order until the channel closes or the session
/// is torn down
pub(super) async fn run(session: Arc<Session>, mut events: mpsc::Receiver<VadEvent>) {
    let root = session.root.clone();
    loop {
        let event = tokio::select! {
            () = root.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        session.handle_event(event).await;
    }
    tracing::debug!(session_id = %session.id, "event loop stopped");
}

impl Session {
    /// Apply one detector event
    pub(super) async fn handle_event(self: &Arc<Self>, event: VadEvent) {
        let message = event.message.as_deref().unwrap_or_default();
        match event.kind {
            VadEventKind::Start => {
                tracing::debug!(session_id = %self.id, message, "speech started");
                self.voice_active.store(true, Ordering::Release);
                self.on_speech_start().await;
            }
            VadEventKind::End => {
                tracing::debug!(session_id = %self.id, message, "speech ended");
                self.voice_active.store(false, Ordering::Release);
                self.on_speech_end().await;
            }
            VadEventKind::Continue => {
                tracing::trace!(session_id = %self.id, message, "speech continuing");
            }
        }
    }

    async fn on_speech_start(&self) {
        let state = self.state();
        if state.is_engaged() {
            tracing::trace!(session_id = %self.id, %state, "utterance in progress, skipping trigger check");
            return;
        }
        if state != State::Idle {
            return;
        }
        let Some(trigger) = self.backends.trigger.clone() else {
            tracing::debug!(session_id = %self.id, "no trigger detector configured");
            return;
        };

        let window = self.preroll.snapshot();
        let check = self.cancels.register(TRIGGER_CHECK);
        let result = call_guarded(
            "trigger check",
            self.settings.call_timeout,
            check.token(),
            trigger.is_triggered(&window, check.token()),
        )
        .await;

        match result {
            Ok(true) => self.enter_capture(&check).await,
            Ok(false) => tracing::debug!(session_id = %self.id, "no trigger"),
            Err(e) if e.is_cancelled() => {
                tracing::debug!(session_id = %self.id, "trigger check cancelled");
            }
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "trigger check failed"),
        }
        // Stays registered until capture is decided so a reset can still veto it
        self.cancels.deregister(&check);
    }

    async fn enter_capture(&self, check: &CancelHandle) {
        if !self.compare_and_set_unless_cancelled(check.token(), State::Idle, State::Triggered) {
            tracing::debug!(
                session_id = %self.id,
                cancelled = check.is_cancelled(),
                "trigger superseded"
            );
            return;
        }
        self.triggered.store(true, Ordering::Release);
        self.buffer.clear();
        tracing::info!(session_id = %self.id, "triggered");
        let status = ServerMessage::status(State::Triggered, "Listening to you...");
        if let Err(e) = self.outbound.send_scoped(check.token(), status).await {
            tracing::debug!(session_id = %self.id, error = %e, "trigger status not delivered");
        }
    }

    async fn on_speech_end(self: &Arc<Self>) {
        if !self.compare_and_set(State::Triggered, State::Processing) {
            tracing::trace!(session_id = %self.id, "not capturing, ignoring speech end");
            return;
        }
        self.triggered.store(false, Ordering::Release);
        self.send_status(State::Processing, "Processing your request...")
            .await;
        self.launch_pipeline();
    }

    /// Start a response pipeline, cancelling and awaiting any previous one
    fn launch_pipeline(self: &Arc<Self>) {
        let handle = self.cancels.register(super::cancel::PROCESSING);
        let mut slot = self.pipeline_slot();
        let previous = slot.take();
        let session = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    tracing::warn!(session_id = %session.id, error = %e, "previous pipeline failed");
                }
            }
            pipeline::run(session, handle).await;
        }));
    }
}
