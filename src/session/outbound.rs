//! Write side of a session's transport

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::protocol::OutboundFrame;
use crate::{Error, Result};

/// Queue of frames bound for one client
///
/// Frames are drained by the connection's writer task. Pipeline writes go
/// through a send gate: the cancellation check and the enqueue happen while
/// the gate is held, so once [`Outbound::barrier`] returns after a cancel, no
/// frame from the cancelled operation can still be enqueued.
#[derive(Debug)]
pub struct Outbound {
    tx: mpsc::Sender<OutboundFrame>,
    gate: Mutex<()>,
}

impl Outbound {
    /// Wrap an existing sender
    #[must_use]
    pub fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            tx,
            gate: Mutex::new(()),
        }
    }

    /// Create a queue with `capacity` slots and return its receiving end
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Enqueue a session-level frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the writer has gone away
    pub async fn send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        self.tx
            .send(frame.into())
            .await
            .map_err(|_| Error::Transport("client channel closed".to_string()))
    }

    /// Enqueue a frame on behalf of a cancellable operation
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `token` fired before the frame was
    /// queued, or [`Error::Transport`] if the writer has gone away
    pub async fn send_scoped(
        &self,
        token: &CancellationToken,
        frame: impl Into<OutboundFrame>,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::Cancelled),
            sent = self.tx.send(frame.into()) => {
                sent.map_err(|_| Error::Transport("client channel closed".to_string()))
            }
        }
    }

    /// Wait until no scoped send is in progress
    pub async fn barrier(&self) {
        drop(self.gate.lock().await);
    }

    /// Whether the writer has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
