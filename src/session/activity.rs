//! Voice activity detection for the local microphone plus the scripted
//! remote-speaker source used while no real transport is attached.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::CallTuning;
use crate::media::DeviceHandle;

use super::Participant;

pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Polls the live microphone tap on a fixed cadence. The decision is made
/// from the energy of the current sampling window alone, so a quiet period
/// reads as not-speaking within one tick.
pub struct VoiceActivityMonitor {
    threshold: f32,
    handle: Option<DeviceHandle>,
    scratch: Vec<f32>,
}

impl VoiceActivityMonitor {
    pub fn new(tuning: &CallTuning) -> Self {
        Self {
            threshold: tuning.vad_threshold,
            handle: None,
            scratch: Vec::new(),
        }
    }

    pub fn start(&mut self, handle: DeviceHandle) {
        self.handle = Some(handle);
    }

    pub fn stop(&mut self) {
        self.handle = None;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// One sampling period. A released handle or a muted microphone reads as
    /// silence immediately.
    pub fn tick(&mut self) -> bool {
        let Some(handle) = self.handle.as_ref() else {
            return false;
        };
        if handle.is_released() {
            return false;
        }

        self.scratch.clear();
        handle.drain_audio(&mut self.scratch);
        if !handle.audio_enabled() {
            return false;
        }
        rms_level(&self.scratch) >= self.threshold
    }
}

/// Source of the "who is talking" signal for remote participants. With no
/// media transport attached there is nothing to measure, so the session runs
/// on a pluggable source; production uses the random one below.
pub trait RemoteActivitySource: Send {
    fn poll_active(&mut self, participants: &[Participant]) -> Option<String>;
}

pub struct RandomRemoteActivity {
    probability: f64,
    rng: StdRng,
}

impl RandomRemoteActivity {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(probability: f64, seed: u64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RemoteActivitySource for RandomRemoteActivity {
    fn poll_active(&mut self, participants: &[Participant]) -> Option<String> {
        if participants.is_empty() || !self.rng.gen_bool(self.probability) {
            return None;
        }
        let pick = self.rng.gen_range(0..participants.len());
        Some(participants[pick].id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{
        AcquireKind, MediaQuality, MediaResourceManager, SimulatedCaptureBackend,
    };
    use std::sync::Arc;

    fn acquire_audio(backend: &Arc<SimulatedCaptureBackend>) -> (MediaResourceManager, DeviceHandle) {
        let manager = MediaResourceManager::new(Arc::clone(backend) as _);
        let handle = manager
            .acquire(AcquireKind::AudioOnly, MediaQuality::Standard)
            .expect("acquires audio");
        (manager, handle)
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0.0; 64]), 0.0);
    }

    #[test]
    fn rms_of_constant_signal_matches_amplitude() {
        let level = rms_level(&[0.5; 128]);
        assert!((level - 0.5).abs() < 1e-6);
    }

    #[test]
    fn loud_input_reads_as_speaking() {
        let backend = Arc::new(SimulatedCaptureBackend::new());
        let (_manager, handle) = acquire_audio(&backend);

        let mut monitor = VoiceActivityMonitor::new(&CallTuning::default());
        monitor.start(handle);

        backend.push_microphone_samples(&[0.4; 256]);
        assert!(monitor.tick());
    }

    #[test]
    fn silence_reads_as_not_speaking_within_one_tick() {
        let backend = Arc::new(SimulatedCaptureBackend::new());
        let (_manager, handle) = acquire_audio(&backend);

        let mut monitor = VoiceActivityMonitor::new(&CallTuning::default());
        monitor.start(handle);

        backend.push_microphone_samples(&[0.4; 256]);
        assert!(monitor.tick());
        assert!(!monitor.tick(), "no hysteresis past the sampling window");

        backend.push_microphone_samples(&[0.001; 256]);
        assert!(!monitor.tick(), "quiet input stays below the threshold");
    }

    #[test]
    fn muted_microphone_reads_as_silence() {
        let backend = Arc::new(SimulatedCaptureBackend::new());
        let (_manager, handle) = acquire_audio(&backend);
        handle.set_audio_enabled(false);

        let mut monitor = VoiceActivityMonitor::new(&CallTuning::default());
        monitor.start(handle);

        backend.push_microphone_samples(&[0.4; 256]);
        assert!(!monitor.tick());
    }

    #[test]
    fn released_handle_reads_as_silence() {
        let backend = Arc::new(SimulatedCaptureBackend::new());
        let (manager, handle) = acquire_audio(&backend);

        let mut monitor = VoiceActivityMonitor::new(&CallTuning::default());
        backend.push_microphone_samples(&[0.4; 256]);
        monitor.start(handle.clone());
        assert!(monitor.tick());

        manager.release(&handle);
        assert!(!monitor.tick());
    }

    #[test]
    fn zero_probability_source_never_picks_a_speaker() {
        let participants = vec![Participant {
            id: "p1".to_string(),
            name: "Ada".to_string(),
        }];
        let mut source = RandomRemoteActivity::with_seed(0.0, 7);
        for _ in 0..32 {
            assert_eq!(source.poll_active(&participants), None);
        }
    }

    #[test]
    fn certain_probability_source_picks_a_known_participant() {
        let participants = vec![
            Participant {
                id: "p1".to_string(),
                name: "Ada".to_string(),
            },
            Participant {
                id: "p2".to_string(),
                name: "Grace".to_string(),
            },
        ];
        let mut source = RandomRemoteActivity::with_seed(1.0, 7);
        for _ in 0..32 {
            let active = source.poll_active(&participants).expect("always active");
            assert!(active == "p1" || active == "p2");
        }
    }

    #[test]
    fn empty_roster_yields_no_speaker() {
        let mut source = RandomRemoteActivity::with_seed(1.0, 7);
        assert_eq!(source.poll_active(&[]), None);
    }
}
