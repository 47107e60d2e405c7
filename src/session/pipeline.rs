//! Response pipeline: transcribe, generate, segment, synthesize, play
//!
//! One pipeline runs per utterance. Generation and synthesis overlap: each
//! completed sentence is handed to its own synthesis task as soon as it is
//! recognized, and a playback task writes the results in sentence order.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cancel::CancelHandle;
use super::{Session, State};
use crate::backends::{FragmentStream, call_guarded};
use crate::protocol::{OutboundFrame, ServerMessage};
use crate::Error;

/// Splits an incrementally arriving reply into sentences
///
/// A sentence ends at the last `.`, `!` or `?` in the running text, but only
/// once at least one more character has arrived after it. That keeps
/// decimals and ellipses intact until the stream moves past them.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    pending: String,
}

impl SentenceSegmenter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment, returning a completed sentence if one closed
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.pending.push_str(fragment);

        let end = self.pending.rfind(['.', '!', '?'])? + 1;
        if end >= self.pending.len() {
            return None;
        }

        let rest = self.pending.split_off(end);
        let sentence = std::mem::replace(&mut self.pending, rest);
        let sentence = sentence.trim();
        (!sentence.is_empty()).then(|| sentence.to_string())
    }

    /// Flush whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Text received but not yet emitted as a sentence
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.pending
    }
}

/// Why a reply ended early
#[derive(Debug)]
enum Abort {
    /// Cancelled or superseded; exit without a word to the client
    Cancelled,
    /// Client-visible failure detail
    Failed(String),
    /// Writer is gone; the connection is tearing down
    Disconnected,
}

impl Abort {
    fn from_step(err: Error, detail: &'static str) -> Self {
        match err {
            Error::Cancelled => Self::Cancelled,
            Error::Transport(_) => Self::Disconnected,
            err => {
                tracing::warn!(error = %err, detail, "pipeline step failed");
                Self::Failed(detail.to_string())
            }
        }
    }

    /// A capability the step needs is not configured
    fn unavailable(err: Error) -> Self {
        Self::Failed(err.to_string())
    }

    fn from_send(err: Error) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Disconnected
        }
    }
}

type SynthesisTask = JoinHandle<crate::Result<Vec<u8>>>;

/// Run one pipeline to completion under `handle`, then deregister it
pub(super) async fn run(session: Arc<Session>, handle: CancelHandle) {
    let token = handle.token().clone();

    match respond(&session, &token).await {
        Ok(()) => tracing::info!(session_id = %session.id, "reply complete"),
        Err(Abort::Cancelled) => tracing::debug!(session_id = %session.id, "pipeline cancelled"),
        Err(Abort::Disconnected) => {
            tracing::debug!(session_id = %session.id, "client gone, abandoning reply");
        }
        Err(Abort::Failed(detail)) => session.fail_scoped(&token, &detail).await,
    }

    session.cancels.deregister(&handle);
}

async fn respond(session: &Arc<Session>, token: &CancellationToken) -> Result<(), Abort> {
    let deadline = session.settings.call_timeout;

    let chunks = session.buffer.drain_all();
    let transcriber = session
        .backends
        .require_transcriber()
        .map_err(Abort::unavailable)?;
    if chunks.is_empty() {
        return Err(Abort::Failed("No audio captured".to_string()));
    }

    tracing::debug!(session_id = %session.id, chunks = chunks.len(), "transcribing utterance");
    let transcript = call_guarded(
        "transcription",
        deadline,
        token,
        transcriber.transcribe(&chunks, token),
    )
    .await
    .map_err(|e| Abort::from_step(e, "Failed to transcribe audio"))?;

    let transcript = transcript.trim().to_string();
    if transcript.is_empty() {
        return Err(Abort::Failed("No speech recognized".to_string()));
    }
    tracing::info!(session_id = %session.id, transcript = %transcript, "transcribed");
    session.set_transcript(transcript.clone());
    session
        .outbound
        .send_scoped(
            token,
            ServerMessage::Transcript {
                text: transcript.clone(),
                is_final: true,
            },
        )
        .await
        .map_err(Abort::from_send)?;

    let generator = session
        .backends
        .require_generator()
        .map_err(Abort::unavailable)?;
    let fragments = call_guarded(
        "generation",
        deadline,
        token,
        generator.generate(&transcript, token),
    )
    .await
    .map_err(|e| Abort::from_step(e, "Failed to get AI response"))?;

    advance(session, token, State::Speaking, "Speaking...").await?;
    speak(session, token, fragments).await?;
    advance(session, token, State::Idle, "Ready").await
}

/// Move to `next` and announce it, unless the pipeline has been cancelled
async fn advance(
    session: &Session,
    token: &CancellationToken,
    next: State,
    detail: &str,
) -> Result<(), Abort> {
    if !session.transition_unless_cancelled(token, next) {
        return Err(Abort::Cancelled);
    }
    session
        .outbound
        .send_scoped(token, ServerMessage::status(next, detail))
        .await
        .map_err(Abort::from_send)
}

/// Consume the reply stream, dispatching synthesis per sentence
async fn speak(
    session: &Arc<Session>,
    token: &CancellationToken,
    fragments: FragmentStream,
) -> Result<(), Abort> {
    // Cancelled on any early exit so in-flight synthesis stops too
    let speech = token.child_token();
    let _guard = speech.clone().drop_guard();

    let (queue, pending) = mpsc::channel(session.settings.max_pending_synthesis.max(1));
    let playback = tokio::spawn(play_in_order(
        Arc::clone(session),
        speech.clone(),
        pending,
    ));

    let streamed = stream_reply(session, token, &speech, fragments, queue).await;
    if let Err(abort) = streamed {
        speech.cancel();
        playback.abort();
        return Err(abort);
    }

    match playback.await {
        Ok(played) => played,
        Err(e) => {
            tracing::warn!(session_id = %session.id, error = %e, "playback task failed");
            Err(Abort::Failed("Response interrupted".to_string()))
        }
    }
}

async fn stream_reply(
    session: &Arc<Session>,
    token: &CancellationToken,
    speech: &CancellationToken,
    mut fragments: FragmentStream,
    queue: mpsc::Sender<SynthesisTask>,
) -> Result<(), Abort> {
    let mut segmenter = SentenceSegmenter::new();

    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Abort::Cancelled),
            next = fragments.next() => next,
        };
        let fragment = match next {
            None => break,
            Some(Ok(fragment)) => fragment,
            Some(Err(e)) => return Err(Abort::from_step(e, "Response interrupted")),
        };
        if fragment.is_empty() {
            continue;
        }

        if let Some(sentence) = segmenter.push(&fragment) {
            submit(session, token, speech, &queue, sentence).await?;
        }
        session
            .outbound
            .send_scoped(token, ServerMessage::Response { text: fragment })
            .await
            .map_err(Abort::from_send)?;
    }

    if let Some(rest) = segmenter.finish() {
        submit(session, token, speech, &queue, rest).await?;
    }
    Ok(())
}

/// Start synthesis of one sentence and queue it for playback
async fn submit(
    session: &Session,
    token: &CancellationToken,
    speech: &CancellationToken,
    queue: &mpsc::Sender<SynthesisTask>,
    sentence: String,
) -> Result<(), Abort> {
    let Some(synthesizer) = session.backends.synthesizer.clone() else {
        tracing::debug!(session_id = %session.id, "no synthesizer, text-only reply");
        return Ok(());
    };
    tracing::debug!(session_id = %session.id, sentence = %sentence, "synthesizing");

    let deadline = session.settings.call_timeout;
    let cancel = speech.clone();
    let task = tokio::spawn(async move {
        call_guarded(
            "synthesis",
            deadline,
            &cancel,
            synthesizer.synthesize(&sentence, &cancel),
        )
        .await
    });

    tokio::select! {
        biased;
        () = token.cancelled() => Err(Abort::Cancelled),
        queued = queue.send(task) => queued.map_err(|_| Abort::Cancelled),
    }
}

/// Write synthesized audio in submission order
async fn play_in_order(
    session: Arc<Session>,
    speech: CancellationToken,
    mut pending: mpsc::Receiver<SynthesisTask>,
) -> Result<(), Abort> {
    while let Some(task) = pending.recv().await {
        let joined = tokio::select! {
            biased;
            () = speech.cancelled() => return Err(Abort::Cancelled),
            joined = task => joined,
        };

        match joined {
            Ok(Ok(audio)) if audio.is_empty() => {
                tracing::debug!(session_id = %session.id, "empty synthesis result");
            }
            Ok(Ok(audio)) => session
                .outbound
                .send_scoped(&speech, OutboundFrame::Audio(audio))
                .await
                .map_err(Abort::from_send)?,
            Ok(Err(Error::Cancelled)) => return Err(Abort::Cancelled),
            Ok(Err(e)) => {
                tracing::warn!(session_id = %session.id, error = %e, "synthesis failed, skipping sentence");
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "synthesis task failed");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(fragments: &[&str]) -> Vec<String> {
        let mut segmenter = SentenceSegmenter::new();
        let mut sentences: Vec<String> = fragments
            .iter()
            .filter_map(|f| segmenter.push(f))
            .collect();
        sentences.extend(segmenter.finish());
        sentences
    }

    #[test]
    fn splits_reply_into_two_sentences() {
        let sentences = segment(&["Hi, ", "how are ", "you? ", "I'm ", "fine."]);
        assert_eq!(sentences, vec!["Hi, how are you?", "I'm fine."]);
    }

    #[test]
    fn waits_for_a_character_after_the_mark() {
        let mut segmenter = SentenceSegmenter::new();
        assert_eq!(segmenter.push("It costs 3."), None);
        assert_eq!(segmenter.push("50 dollars. "), Some("It costs 3.50 dollars.".to_string()));
        assert_eq!(segmenter.pending(), " ");
        assert_eq!(segmenter.finish(), None);
    }

    #[test]
    fn splits_at_last_mark_in_buffer() {
        let mut segmenter = SentenceSegmenter::new();
        assert_eq!(
            segmenter.push("Yes. Sure! And then"),
            Some("Yes. Sure!".to_string())
        );
        assert_eq!(segmenter.finish(), Some("And then".to_string()));
    }

    #[test]
    fn unterminated_reply_is_flushed() {
        assert_eq!(segment(&["just ", "words"]), vec!["just words"]);
    }

    #[test]
    fn whitespace_only_remainder_is_dropped() {
        assert_eq!(segment(&["Done. ", "  "]), vec!["Done."]);
        assert!(segment(&[]).is_empty());
    }

    #[test]
    fn multibyte_text_splits_cleanly() {
        assert_eq!(segment(&["¿Qué tal? ", "Très bien."]), vec!["¿Qué tal?", "Très bien."]);
    }
}
