//! Murmur Gateway - real-time voice assistant session orchestrator
//!
//! Bridges a browser audio stream to a set of inference backends: voice
//! activity detection, wake trigger, speech-to-text, a language model and
//! text-to-speech.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          Browser  (PCM frames + JSON commands)       │
//! └────────────────────────┬─────────────────────────────┘
//!                          │ WebSocket
//! ┌────────────────────────▼─────────────────────────────┐
//! │                   Murmur Gateway                     │
//! │  api  │  Session (state, buffer, events, pipeline)   │
//! └────────────────────────┬─────────────────────────────┘
//!                          │ backends
//! ┌────────────────────────▼─────────────────────────────┐
//! │   VAD  │  Trigger  │  STT  │  LLM  │  TTS            │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod audio;
pub mod backends;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;

pub use backends::Backends;
pub use config::Config;
pub use error::{Error, Result};
pub use session::{Session, SessionRegistry, SessionSettings, State};
