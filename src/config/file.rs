//! TOML configuration file loading
//!
//! Supports `~/.config/murmur/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::backends::{SttProvider, TtsProvider};
use crate::{Error, Result};

use super::TriggerMode;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MurmurConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub stt: SttFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    #[serde(default)]
    pub trigger: TriggerFileConfig,

    #[serde(default)]
    pub vad: VadFileConfig,

    #[serde(default)]
    pub session: SessionFileConfig,

    #[serde(default)]
    pub retry: RetryFileConfig,
}

/// HTTP server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,

    /// Directory with the browser client
    pub static_dir: Option<PathBuf>,
}

/// Speech-to-text service
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub url: Option<String>,
    pub provider: Option<SttProvider>,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

/// Completion service
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
}

/// Text-to-speech service
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub url: Option<String>,
    pub provider: Option<TtsProvider>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub api_key: Option<String>,
}

/// Wake trigger
#[derive(Debug, Default, Deserialize)]
pub struct TriggerFileConfig {
    pub mode: Option<TriggerMode>,
    pub wake_words: Option<Vec<String>>,
    pub threshold: Option<f32>,
}

/// Voice activity detection thresholds
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub threshold: Option<f32>,
    pub silence_ms: Option<u64>,
    pub min_speech_ms: Option<u64>,
}

/// Per-session limits
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub sample_rate: Option<u32>,
    pub preroll_ms: Option<u64>,
    pub max_buffered_ms: Option<u64>,
    pub call_timeout_secs: Option<u64>,
    pub max_pending_synthesis: Option<usize>,
}

/// Backend retry policy
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path
/// is tried and any problem with it falls back to defaults.
///
/// # Errors
///
/// Returns error if an explicitly given file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<MurmurConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = parse(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(MurmurConfigFile::default());
    };

    if !path.exists() {
        return Ok(MurmurConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(MurmurConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(MurmurConfigFile::default())
        }
    }
}

/// Parse config file content
///
/// # Errors
///
/// Returns error on invalid TOML or unknown sections
pub fn parse(content: &str) -> Result<MurmurConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/murmur/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("murmur").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = parse("").unwrap();
        assert!(config.server.port.is_none());
        assert!(config.stt.url.is_none());
        assert!(config.trigger.wake_words.is_none());
    }

    #[test]
    fn sections_parse() {
        let config = parse(
            r#"
            [server]
            port = 9000

            [stt]
            url = "https://api.deepgram.com"
            provider = "deepgram"

            [tts]
            provider = "elevenlabs"
            voice = "rachel"

            [trigger]
            mode = "wake-word"
            wake_words = ["hey murmur"]

            [session]
            max_buffered_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, Some(9000));
        assert_eq!(config.stt.provider, Some(SttProvider::Deepgram));
        assert_eq!(config.tts.provider, Some(TtsProvider::ElevenLabs));
        assert_eq!(config.trigger.mode, Some(TriggerMode::WakeWord));
        assert_eq!(config.session.max_buffered_ms, Some(0));
    }

    #[test]
    fn unknown_section_is_rejected() {
        assert!(matches!(parse("[persona]\nname = \"x\""), Err(Error::Toml(_))));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = load_config_file(Some(Path::new("/nonexistent/murmur.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
