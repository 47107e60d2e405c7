//! Error types for the Murmur gateway

use thiserror::Error;

/// Result type alias for Murmur operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Murmur gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend capability is not available (construction or dial failure)
    #[error("{0} unavailable")]
    Unavailable(&'static str),

    /// Voice activity detector error
    #[error("detector error: {0}")]
    Detector(String),

    /// Trigger (wake word) detection error
    #[error("trigger error: {0}")]
    Trigger(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Transcription(String),

    /// Language model error
    #[error("LLM error: {0}")]
    Generation(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Synthesis(String),

    /// Audio encoding/decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// A backend answered with a non-success status
    #[error("{service} returned {status}: {body}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// Connection to the client is gone
    #[error("transport error: {0}")]
    Transport(String),

    /// A backend call exceeded its deadline
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Operation was cancelled; never reported to the client
    #[error("operation cancelled")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error is a cancellation rather than a failure
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether retrying the same call may succeed
    ///
    /// Connection-level HTTP failures, rate limits, server errors and
    /// timeouts are transient. Client errors, parse failures and
    /// cancellation are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::Upstream { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_message_names_the_service() {
        let err = Error::Unavailable("STT service");
        assert_eq!(err.to_string(), "STT service unavailable");
    }

    #[test]
    fn cancellation_is_not_transient() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_transient());
        assert!(Error::Timeout("transcription").is_transient());
        assert!(!Error::Transcription("bad audio".to_string()).is_transient());
    }

    #[test]
    fn upstream_status_decides_retry() {
        let upstream = |status| Error::Upstream {
            service: "TTS",
            status,
            body: String::new(),
        };
        assert!(upstream(429).is_transient());
        assert!(upstream(503).is_transient());
        assert!(!upstream(400).is_transient());
        assert!(!upstream(401).is_transient());
        assert_eq!(upstream(502).to_string(), "TTS returned 502: ");
    }
}
