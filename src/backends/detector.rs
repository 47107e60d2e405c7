//! Energy-based voice activity detection

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{DetectorProvider, VoiceActivityDetector};
use crate::audio::{self, AudioChunk};
use crate::session::{VadEvent, VadEventSender};
use crate::{Error, Result};

/// Thresholds for [`EnergyDetector`]
#[derive(Debug, Clone)]
pub struct VadSettings {
    /// RMS energy above which a frame counts as speech
    pub threshold: f32,
    /// Silence after speech that ends an utterance
    pub silence_ms: u64,
    /// Speech needed before activity is reported at all
    pub min_speech_ms: u64,
    pub sample_rate: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 0.03,
            silence_ms: 500,
            min_speech_ms: 300,
            sample_rate: audio::SAMPLE_RATE,
        }
    }
}

impl VadSettings {
    fn samples(&self, ms: u64) -> usize {
        audio::bytes_for_duration(ms, self.sample_rate) / 2
    }
}

/// Opens an [`EnergyDetector`] per session
#[derive(Debug, Clone, Default)]
pub struct EnergyDetectorProvider {
    settings: VadSettings,
}

impl EnergyDetectorProvider {
    #[must_use]
    pub const fn new(settings: VadSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl DetectorProvider for EnergyDetectorProvider {
    async fn open(&self, events: VadEventSender) -> Result<Arc<dyn VoiceActivityDetector>> {
        Ok(Arc::new(EnergyDetector::new(self.settings.clone(), events)))
    }
}

/// Phase of the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    /// Waiting for speech
    #[default]
    Silent,
    /// Speech seen, not yet long enough to report
    Candidate,
    /// Speech reported, waiting for trailing silence
    Speaking,
}

#[derive(Debug, Default)]
struct Tracker {
    phase: Phase,
    speech_samples: usize,
    silence_samples: usize,
}

/// Reports speech start, continuation and end from frame energy
///
/// Short bursts below `min_speech_ms` never produce events. Once speech has
/// been reported, `silence_ms` of quiet ends it.
#[derive(Debug)]
pub struct EnergyDetector {
    settings: VadSettings,
    events: VadEventSender,
    tracker: Mutex<Tracker>,
}

impl EnergyDetector {
    #[must_use]
    pub fn new(settings: VadSettings, events: VadEventSender) -> Self {
        Self {
            settings,
            events,
            tracker: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the tracker by one frame of samples
    fn observe(&self, samples: &[f32]) {
        let energy = audio::rms_energy(samples);
        let is_speech = energy > self.settings.threshold;
        let min_speech = self.settings.samples(self.settings.min_speech_ms);
        let max_silence = self.settings.samples(self.settings.silence_ms);

        let mut tracker = self.lock();
        if is_speech {
            tracker.speech_samples += samples.len();
            tracker.silence_samples = 0;
        } else if tracker.phase != Phase::Silent {
            tracker.silence_samples += samples.len();
        }

        match tracker.phase {
            Phase::Silent if is_speech => {
                tracing::trace!(energy, "speech detected");
                tracker.phase = Phase::Candidate;
                tracker.speech_samples = samples.len();
            }
            Phase::Silent => {}
            Phase::Candidate => {
                if tracker.speech_samples >= min_speech {
                    tracker.phase = Phase::Speaking;
                    self.events
                        .emit(VadEvent::start().with_message(format!("energy {energy:.3}")));
                } else if tracker.silence_samples > max_silence {
                    tracing::trace!("speech too short, ignoring");
                    *tracker = Tracker::default();
                }
            }
            Phase::Speaking => {
                if is_speech {
                    self.events.emit(VadEvent::progress());
                } else if tracker.silence_samples > max_silence {
                    let speech_ms =
                        audio::duration_ms(tracker.speech_samples * 2, self.settings.sample_rate);
                    self.events
                        .emit(VadEvent::end().with_message(format!("{speech_ms}ms of speech")));
                    *tracker = Tracker::default();
                }
            }
        }
    }
}

#[async_trait]
impl VoiceActivityDetector for EnergyDetector {
    async fn process(&self, chunk: &AudioChunk) -> Result<()> {
        if chunk.len() % 2 != 0 {
            return Err(Error::Detector(format!(
                "frame of {} bytes is not whole PCM16 samples",
                chunk.len()
            )));
        }
        self.observe(&chunk.samples());
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.lock().phase == Phase::Speaking
    }

    async fn reset(&self) -> Result<()> {
        *self.lock() = Tracker::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::VadEventKind;

    /// 100ms of constant-amplitude audio at 16kHz
    fn frame(amplitude: f32) -> Vec<f32> {
        vec![amplitude; 1600]
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<VadEvent>) -> Vec<VadEventKind> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect()
    }

    #[test]
    fn reports_start_progress_and_end() {
        let (events, mut rx) = VadEventSender::channel(64);
        let detector = EnergyDetector::new(VadSettings::default(), events);

        for _ in 0..5 {
            detector.observe(&frame(0.5));
        }
        assert!(detector.is_active());
        for _ in 0..7 {
            detector.observe(&frame(0.0));
        }
        assert!(!detector.is_active());

        let kinds = drain(&mut rx);
        assert_eq!(kinds.first(), Some(&VadEventKind::Start));
        assert_eq!(kinds.last(), Some(&VadEventKind::End));
        assert_eq!(kinds.iter().filter(|k| **k == VadEventKind::Start).count(), 1);
        assert!(kinds.contains(&VadEventKind::Continue));
    }

    #[test]
    fn short_burst_is_ignored() {
        let (events, mut rx) = VadEventSender::channel(64);
        let detector = EnergyDetector::new(VadSettings::default(), events);

        detector.observe(&frame(0.5));
        for _ in 0..10 {
            detector.observe(&frame(0.0));
        }
        assert!(drain(&mut rx).is_empty());
        assert!(!detector.is_active());
    }

    #[tokio::test]
    async fn reset_forgets_activity() {
        let (events, mut rx) = VadEventSender::channel(64);
        let detector = EnergyDetector::new(VadSettings::default(), events);

        for _ in 0..3 {
            detector.observe(&frame(0.5));
        }
        assert!(detector.is_active());
        detector.reset().await.unwrap();
        assert!(!detector.is_active());

        for _ in 0..10 {
            detector.observe(&frame(0.0));
        }
        assert_eq!(drain(&mut rx), vec![VadEventKind::Start]);
    }

    #[tokio::test]
    async fn partial_sample_frame_is_rejected() {
        let (events, mut rx) = VadEventSender::channel(64);
        let detector = EnergyDetector::new(VadSettings::default(), events);

        let err = detector
            .process(&AudioChunk::from(vec![0u8; 321]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Detector(_)));
        assert!(drain(&mut rx).is_empty());
        detector.process(&AudioChunk::from(vec![0u8; 320])).await.unwrap();
    }
}
