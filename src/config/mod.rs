//! Configuration management for the Murmur gateway
//!
//! Values come from command-line flags and environment variables first, then
//! the optional TOML file, then built-in defaults.

pub mod file;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::backends::{
    Backends, CompletionClient, EnergyDetectorProvider, EnergyTrigger, Generator,
    HttpSynthesizer, HttpTranscriber, RetryPolicy, SttProvider, Synthesizer, Transcriber,
    TriggerDetector, TtsProvider, VadSettings, WakeWordTrigger,
};
use crate::session::SessionSettings;
use crate::{Result, audio};

pub use file::{MurmurConfigFile, config_file_path, load_config_file};

/// How the wake trigger is decided
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Wake words when configured and a transcriber exists, otherwise energy
    #[default]
    Auto,
    /// Any loud enough speech triggers
    Energy,
    /// Speech must contain a wake word
    WakeWord,
    /// Never trigger
    Off,
}

/// Flags and environment overrides
///
/// Every field is optional so that unset values fall through to the config
/// file.
#[derive(Debug, Default, clap::Args)]
pub struct Overrides {
    /// Path to a TOML config file
    #[arg(long, env = "MURMUR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory with the browser client
    #[arg(long, env = "MURMUR_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Speech-to-text service base URL
    #[arg(long = "stt", env = "STT_SERVICE")]
    pub stt_url: Option<String>,

    #[arg(long, env = "MURMUR_STT_PROVIDER", value_enum)]
    pub stt_provider: Option<SttProvider>,

    #[arg(long, env = "MURMUR_STT_MODEL")]
    pub stt_model: Option<String>,

    #[arg(long, env = "MURMUR_STT_API_KEY", hide_env_values = true)]
    pub stt_api_key: Option<String>,

    /// Completion service base URL
    #[arg(long = "llm", env = "LLM_SERVICE")]
    pub llm_url: Option<String>,

    #[arg(long, env = "MURMUR_LLM_MODEL")]
    pub llm_model: Option<String>,

    #[arg(long, env = "MURMUR_LLM_MAX_TOKENS")]
    pub llm_max_tokens: Option<u32>,

    #[arg(long, env = "MURMUR_LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Text-to-speech service base URL
    #[arg(long = "tts", env = "TTS_SERVICE")]
    pub tts_url: Option<String>,

    #[arg(long, env = "MURMUR_TTS_PROVIDER", value_enum)]
    pub tts_provider: Option<TtsProvider>,

    #[arg(long, env = "MURMUR_TTS_MODEL")]
    pub tts_model: Option<String>,

    #[arg(long, env = "MURMUR_TTS_VOICE")]
    pub tts_voice: Option<String>,

    #[arg(long, env = "MURMUR_TTS_SPEED")]
    pub tts_speed: Option<f32>,

    #[arg(long, env = "MURMUR_TTS_API_KEY", hide_env_values = true)]
    pub tts_api_key: Option<String>,

    #[arg(long, env = "MURMUR_TRIGGER", value_enum)]
    pub trigger: Option<TriggerMode>,

    /// Wake words, comma separated
    #[arg(long, env = "MURMUR_WAKE_WORDS", value_delimiter = ',')]
    pub wake_words: Option<Vec<String>>,

    /// RMS energy the pre-roll window must exceed for an energy trigger
    #[arg(long, env = "MURMUR_TRIGGER_THRESHOLD")]
    pub trigger_threshold: Option<f32>,

    #[arg(long, env = "MURMUR_VAD_THRESHOLD")]
    pub vad_threshold: Option<f32>,

    #[arg(long, env = "MURMUR_VAD_SILENCE_MS")]
    pub vad_silence_ms: Option<u64>,

    #[arg(long, env = "MURMUR_VAD_MIN_SPEECH_MS")]
    pub vad_min_speech_ms: Option<u64>,

    #[arg(long, env = "MURMUR_PREROLL_MS")]
    pub preroll_ms: Option<u64>,

    /// Cap on one captured utterance, 0 for unbounded
    #[arg(long, env = "MURMUR_MAX_BUFFERED_MS")]
    pub max_buffered_ms: Option<u64>,

    /// Deadline for each backend call, 0 for none
    #[arg(long, env = "MURMUR_CALL_TIMEOUT_SECS")]
    pub call_timeout_secs: Option<u64>,

    #[arg(long, env = "MURMUR_MAX_PENDING_SYNTHESIS")]
    pub max_pending_synthesis: Option<usize>,

    #[arg(long, env = "MURMUR_MAX_RETRIES")]
    pub max_retries: Option<u32>,
}

/// A backend service endpoint
#[derive(Debug)]
pub struct ServiceConfig<P> {
    pub url: String,
    pub provider: P,
    pub model: String,
    pub api_key: Option<SecretString>,
}

/// Murmur gateway configuration
#[derive(Debug)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// Directory with the browser client
    pub static_dir: PathBuf,

    /// Speech-to-text service, `None` when not configured
    pub stt: Option<ServiceConfig<SttProvider>>,

    /// Completion service, `None` when not configured
    pub llm: Option<ServiceConfig<()>>,

    pub llm_max_tokens: u32,

    /// Text-to-speech service, `None` when not configured
    pub tts: Option<ServiceConfig<TtsProvider>>,

    pub tts_voice: String,

    pub tts_speed: f32,

    pub trigger: TriggerMode,

    /// Normalized later by the wake word trigger
    pub wake_words: Vec<String>,

    pub trigger_threshold: f32,

    pub vad: VadSettings,

    pub session: SessionSettings,

    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from overrides and the config file
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly named config file cannot be loaded
    pub fn load(overrides: Overrides) -> Result<Self> {
        let fc = load_config_file(overrides.config.as_deref())?;
        Ok(Self::resolve(overrides, fc))
    }

    /// Merge overrides over the file over defaults
    #[must_use]
    pub fn resolve(o: Overrides, fc: MurmurConfigFile) -> Self {
        let stt = non_empty(o.stt_url.or(fc.stt.url)).map(|url| {
            let provider = o.stt_provider.or(fc.stt.provider).unwrap_or_default();
            ServiceConfig {
                url,
                provider,
                model: o.stt_model.or(fc.stt.model).unwrap_or_else(|| {
                    match provider {
                        SttProvider::Whisper => "whisper-1",
                        SttProvider::Deepgram => "nova-2",
                    }
                    .to_string()
                }),
                api_key: secret(o.stt_api_key.or(fc.stt.api_key).or_else(|| {
                    provider_key(match provider {
                        SttProvider::Whisper => "OPENAI_API_KEY",
                        SttProvider::Deepgram => "DEEPGRAM_API_KEY",
                    })
                })),
            }
        });

        let llm = non_empty(
            o.llm_url
                .or(fc.llm.url)
                .or_else(|| Some("http://localhost:8000".to_string())),
        )
        .map(|url| ServiceConfig {
            url,
            provider: (),
            model: o
                .llm_model
                .or(fc.llm.model)
                .unwrap_or_else(|| "default".to_string()),
            api_key: secret(o.llm_api_key.or(fc.llm.api_key)),
        });

        let tts_provider = o.tts_provider.or(fc.tts.provider).unwrap_or_default();
        let tts = non_empty(o.tts_url.or(fc.tts.url)).map(|url| ServiceConfig {
            url,
            provider: tts_provider,
            model: o.tts_model.or(fc.tts.model).unwrap_or_else(|| {
                match tts_provider {
                    TtsProvider::OpenAi => "tts-1",
                    TtsProvider::ElevenLabs => "eleven_monolingual_v1",
                }
                .to_string()
            }),
            api_key: secret(o.tts_api_key.or(fc.tts.api_key).or_else(|| {
                provider_key(match tts_provider {
                    TtsProvider::OpenAi => "OPENAI_API_KEY",
                    TtsProvider::ElevenLabs => "ELEVENLABS_API_KEY",
                })
            })),
        });

        let session_defaults = SessionSettings::default();
        let sample_rate = fc.session.sample_rate.unwrap_or(audio::SAMPLE_RATE);
        let vad_defaults = VadSettings::default();
        let retry_defaults = RetryPolicy::default();

        let call_timeout_secs = o
            .call_timeout_secs
            .or(fc.session.call_timeout_secs)
            .unwrap_or(30);

        Self {
            port: o.port.or(fc.server.port).unwrap_or(8080),
            static_dir: o
                .static_dir
                .or(fc.server.static_dir)
                .unwrap_or_else(|| PathBuf::from("./static")),
            stt,
            llm,
            llm_max_tokens: o.llm_max_tokens.or(fc.llm.max_tokens).unwrap_or(512),
            tts,
            tts_voice: o
                .tts_voice
                .or(fc.tts.voice)
                .unwrap_or_else(|| "alloy".to_string()),
            tts_speed: o.tts_speed.or(fc.tts.speed).unwrap_or(1.0),
            trigger: o.trigger.or(fc.trigger.mode).unwrap_or_default(),
            wake_words: o
                .wake_words
                .or(fc.trigger.wake_words)
                .unwrap_or_default(),
            trigger_threshold: o
                .trigger_threshold
                .or(fc.trigger.threshold)
                .unwrap_or(0.05),
            vad: VadSettings {
                threshold: o
                    .vad_threshold
                    .or(fc.vad.threshold)
                    .unwrap_or(vad_defaults.threshold),
                silence_ms: o
                    .vad_silence_ms
                    .or(fc.vad.silence_ms)
                    .unwrap_or(vad_defaults.silence_ms),
                min_speech_ms: o
                    .vad_min_speech_ms
                    .or(fc.vad.min_speech_ms)
                    .unwrap_or(vad_defaults.min_speech_ms),
                sample_rate,
            },
            session: SessionSettings {
                sample_rate,
                preroll_ms: o
                    .preroll_ms
                    .or(fc.session.preroll_ms)
                    .unwrap_or(session_defaults.preroll_ms),
                max_buffered_ms: o
                    .max_buffered_ms
                    .or(fc.session.max_buffered_ms)
                    .unwrap_or(session_defaults.max_buffered_ms),
                call_timeout: (call_timeout_secs > 0)
                    .then(|| Duration::from_secs(call_timeout_secs)),
                max_pending_synthesis: o
                    .max_pending_synthesis
                    .or(fc.session.max_pending_synthesis)
                    .unwrap_or(session_defaults.max_pending_synthesis)
                    .max(1),
                event_capacity: session_defaults.event_capacity,
            },
            retry: RetryPolicy {
                max_retries: o
                    .max_retries
                    .or(fc.retry.max_retries)
                    .unwrap_or(retry_defaults.max_retries),
                base_delay: fc
                    .retry
                    .base_delay_ms
                    .map_or(retry_defaults.base_delay, Duration::from_millis),
                max_delay: fc
                    .retry
                    .max_delay_ms
                    .map_or(retry_defaults.max_delay, Duration::from_millis),
            },
        }
    }

    /// Per-session limits derived from this config
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        self.session.clone()
    }

    /// Build the backend clients
    ///
    /// Services without a URL are left out, and so are any whose client cannot
    /// be constructed. Sessions report those as unavailable when needed.
    #[must_use]
    pub fn build_backends(&self) -> Backends {
        let transcriber: Option<Arc<dyn Transcriber>> = self.stt.as_ref().and_then(|stt| {
            HttpTranscriber::new(stt.provider, &stt.url, stt.model.clone(), stt.api_key.clone())
                .map(|t| {
                    Arc::new(
                        t.with_retry(self.retry.clone())
                            .with_sample_rate(self.session.sample_rate),
                    ) as Arc<dyn Transcriber>
                })
                .inspect_err(|e| tracing::warn!(error = %e, "STT service disabled"))
                .ok()
        });

        let generator = self.llm.as_ref().and_then(|llm| {
            CompletionClient::new(
                &llm.url,
                llm.model.clone(),
                self.llm_max_tokens,
                llm.api_key.clone(),
            )
            .map(|c| Arc::new(c.with_retry(self.retry.clone())) as Arc<dyn Generator>)
            .inspect_err(|e| tracing::warn!(error = %e, "LLM service disabled"))
            .ok()
        });

        let synthesizer = self.tts.as_ref().and_then(|tts| {
            HttpSynthesizer::new(
                tts.provider,
                &tts.url,
                self.tts_voice.clone(),
                tts.model.clone(),
                tts.api_key.clone(),
            )
            .map(|s| {
                Arc::new(s.with_speed(self.tts_speed).with_retry(self.retry.clone()))
                    as Arc<dyn Synthesizer>
            })
            .inspect_err(|e| tracing::warn!(error = %e, "TTS service disabled"))
            .ok()
        });

        let trigger = self.build_trigger(transcriber.as_ref());

        let backends = Backends {
            detector: Some(Arc::new(EnergyDetectorProvider::new(self.vad.clone()))),
            trigger,
            transcriber,
            generator,
            synthesizer,
        };
        tracing::info!(available = ?backends.available(), "backends configured");
        backends
    }

    fn build_trigger(
        &self,
        transcriber: Option<&Arc<dyn Transcriber>>,
    ) -> Option<Arc<dyn TriggerDetector>> {
        let wake_word = || {
            transcriber.map(|t| {
                Arc::new(WakeWordTrigger::new(Arc::clone(t), self.wake_words.clone()))
                    as Arc<dyn TriggerDetector>
            })
        };
        let energy = || Arc::new(EnergyTrigger::new(self.trigger_threshold)) as Arc<dyn TriggerDetector>;

        match self.trigger {
            TriggerMode::Off => None,
            TriggerMode::Energy => Some(energy()),
            TriggerMode::WakeWord => {
                let trigger = wake_word();
                if trigger.is_none() {
                    tracing::warn!("wake word trigger needs an STT service, trigger disabled");
                }
                trigger
            }
            TriggerMode::Auto if !self.wake_words.is_empty() => {
                wake_word().or_else(|| Some(energy()))
            }
            TriggerMode::Auto => Some(energy()),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn secret(value: Option<String>) -> Option<SecretString> {
    non_empty(value).map(SecretString::from)
}

fn provider_key(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(o: Overrides, toml: &str) -> Config {
        Config::resolve(o, file::parse(toml).unwrap())
    }

    #[test]
    fn defaults() {
        let config = resolve(Overrides::default(), "");
        assert_eq!(config.port, 8080);
        assert!(config.stt.is_none());
        assert!(config.tts.is_none());
        assert_eq!(config.llm.as_ref().unwrap().url, "http://localhost:8000");
        assert_eq!(config.session.preroll_ms, 1500);
        assert_eq!(config.session.max_buffered_ms, 30_000);
        assert_eq!(config.session.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.trigger, TriggerMode::Auto);
    }

    #[test]
    fn overrides_beat_file() {
        let overrides = Overrides {
            port: Some(9001),
            stt_url: Some("http://stt:9000".to_string()),
            ..Overrides::default()
        };
        let config = resolve(
            overrides,
            r#"
            [server]
            port = 7000
            [stt]
            url = "http://ignored"
            provider = "deepgram"
            "#,
        );
        assert_eq!(config.port, 9001);
        let stt = config.stt.unwrap();
        assert_eq!(stt.url, "http://stt:9000");
        assert_eq!(stt.provider, SttProvider::Deepgram);
        assert_eq!(stt.model, "nova-2");
    }

    #[test]
    fn zero_disables_limits() {
        let overrides = Overrides {
            call_timeout_secs: Some(0),
            max_buffered_ms: Some(0),
            ..Overrides::default()
        };
        let config = resolve(overrides, "");
        assert_eq!(config.session.call_timeout, None);
        assert_eq!(config.session.max_buffered_ms, 0);
    }

    #[test]
    fn empty_llm_url_disables_generation() {
        let overrides = Overrides {
            llm_url: Some(String::new()),
            ..Overrides::default()
        };
        let config = resolve(overrides, "");
        assert!(config.llm.is_none());
        assert!(config.build_backends().generator.is_none());
    }

    #[test]
    fn backends_follow_configured_services() {
        let overrides = Overrides {
            stt_url: Some("http://stt:9000".to_string()),
            tts_url: Some("http://tts:8880".to_string()),
            ..Overrides::default()
        };
        let backends = resolve(overrides, "").build_backends();
        assert_eq!(backends.available(), vec![
            "detector",
            "trigger",
            "transcriber",
            "generator",
            "synthesizer"
        ]);
    }

    #[test]
    fn wake_word_mode_needs_transcriber() {
        let config = resolve(Overrides::default(), "[trigger]\nmode = \"wake-word\"");
        assert!(config.build_backends().trigger.is_none());

        let off = resolve(Overrides::default(), "[trigger]\nmode = \"off\"");
        assert!(off.build_backends().trigger.is_none());
    }

    #[test]
    fn invalid_service_url_is_left_out() {
        let overrides = Overrides {
            tts_url: Some("not a url".to_string()),
            ..Overrides::default()
        };
        assert!(resolve(overrides, "").build_backends().synthesizer.is_none());
    }
}
