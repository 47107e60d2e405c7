//! Session states and the transition table

use serde::Serialize;

/// State of one client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Waiting for voice activity
    Idle,
    /// Voice activity seen, no trigger yet
    Listening,
    /// Wake trigger fired, capturing the utterance
    Triggered,
    /// Transcribing and waiting for the reply stream
    Processing,
    /// Streaming and synthesizing the reply
    Speaking,
    /// Transient failure state, always followed by `Idle`
    Error,
    /// Connection closed
    Disconnected,
}

impl State {
    /// Every state, in declaration order
    pub const ALL: [Self; 7] = [
        Self::Idle,
        Self::Listening,
        Self::Triggered,
        Self::Processing,
        Self::Speaking,
        Self::Error,
        Self::Disconnected,
    ];

    /// Wire name of the state
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Listening => "LISTENING",
            Self::Triggered => "TRIGGERED",
            Self::Processing => "PROCESSING",
            Self::Speaking => "SPEAKING",
            Self::Error => "ERROR",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    /// Whether `self -> next` is a legal edge
    ///
    /// `Disconnected` is terminal. Every other state may reset to `Idle`, fail
    /// into `Error`, or be torn down.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use State::{Disconnected, Error, Idle, Listening, Processing, Speaking, Triggered};

        match self {
            Disconnected => false,
            Error => matches!(next, Idle | Disconnected),
            _ => matches!(
                (self, next),
                (_, Idle | Error | Disconnected)
                    | (Idle, Listening | Triggered)
                    | (Listening, Triggered)
                    | (Triggered, Processing)
                    | (Processing, Speaking)
            ),
        }
    }

    /// Whether the session is busy with an utterance or a reply
    ///
    /// New trigger detection is ignored in these states.
    #[must_use]
    pub const fn is_engaged(self) -> bool {
        matches!(self, Self::Triggered | Self::Processing | Self::Speaking)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
