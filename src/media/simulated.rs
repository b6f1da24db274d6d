//! Scripted capture backend. Outcomes the platform can produce (permission
//! denial, missing hardware, transient failure, an OS-level stop of screen
//! sharing) are triggered explicitly so session behavior can be asserted
//! deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::backend::{
    AudioTap, CaptureBackend, CaptureTrack, ExternalStopHook, MediaQuality, TrackClass, TrackGuard,
};
use super::AcquisitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Granted,
    Denied,
}

struct SimState {
    microphone: Permission,
    camera: Permission,
    screen: Permission,
    camera_present: bool,
    camera_transient_failures: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            microphone: Permission::Granted,
            camera: Permission::Granted,
            screen: Permission::Granted,
            camera_present: true,
            camera_transient_failures: 0,
        }
    }
}

#[derive(Default)]
struct LiveCounters {
    microphone: AtomicUsize,
    camera: AtomicUsize,
    screen_video: AtomicUsize,
    screen_audio: AtomicUsize,
}

impl LiveCounters {
    fn slot(&self, class: TrackClass) -> &AtomicUsize {
        match class {
            TrackClass::Microphone => &self.microphone,
            TrackClass::Camera => &self.camera,
            TrackClass::ScreenVideo => &self.screen_video,
            TrackClass::ScreenAudio => &self.screen_audio,
        }
    }
}

struct SimTrackGuard {
    class: TrackClass,
    counters: Arc<LiveCounters>,
}

impl TrackGuard for SimTrackGuard {
    fn shut_down(&mut self) {
        self.counters.slot(self.class).fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SimulatedCaptureBackend {
    state: Mutex<SimState>,
    counters: Arc<LiveCounters>,
    opened_total: AtomicUsize,
    microphone_tap: Mutex<Option<AudioTap>>,
    screen_hooks: Mutex<Vec<Arc<ExternalStopHook>>>,
    gate: Mutex<bool>,
    gate_signal: Condvar,
}

impl SimulatedCaptureBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            counters: Arc::new(LiveCounters::default()),
            opened_total: AtomicUsize::new(0),
            microphone_tap: Mutex::new(None),
            screen_hooks: Mutex::new(Vec::new()),
            gate: Mutex::new(false),
            gate_signal: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn deny_microphone(&self) {
        self.lock_state().microphone = Permission::Denied;
    }

    pub fn deny_camera(&self) {
        self.lock_state().camera = Permission::Denied;
    }

    pub fn deny_screen(&self) {
        self.lock_state().screen = Permission::Denied;
    }

    pub fn remove_camera(&self) {
        self.lock_state().camera_present = false;
    }

    /// The next camera open fails once with a transient error, then recovers.
    pub fn fail_camera_once(&self) {
        self.lock_state().camera_transient_failures += 1;
    }

    /// Feeds mono samples into the live microphone track's tap, as the
    /// platform audio callback would.
    pub fn push_microphone_samples(&self, samples: &[f32]) {
        let tap = self
            .microphone_tap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tap) = tap.as_ref() {
            tap.push_samples(samples);
        }
    }

    /// Simulates the user stopping screen capture through an OS surface.
    /// Returns how many hooks fired.
    pub fn trigger_screen_external_stop(&self) -> usize {
        let hooks = {
            let mut held = self
                .screen_hooks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *held)
        };
        let fired = hooks.len();
        for hook in hooks {
            hook.fire();
        }
        fired
    }

    /// Holds every subsequent acquisition in flight until
    /// [`Self::release_acquisitions`]; models an unbounded permission prompt.
    pub fn gate_acquisitions(&self) {
        *self
            .gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
    }

    pub fn release_acquisitions(&self) {
        *self
            .gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = false;
        self.gate_signal.notify_all();
    }

    pub fn live_tracks(&self, class: TrackClass) -> usize {
        self.counters.slot(class).load(Ordering::SeqCst)
    }

    pub fn live_track_total(&self) -> usize {
        self.live_tracks(TrackClass::Microphone)
            + self.live_tracks(TrackClass::Camera)
            + self.live_tracks(TrackClass::ScreenVideo)
            + self.live_tracks(TrackClass::ScreenAudio)
    }

    /// Cumulative count of tracks ever opened, stopped or not.
    pub fn opened_track_total(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }

    fn wait_for_gate(&self) {
        let mut gated = self
            .gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *gated {
            gated = self
                .gate_signal
                .wait(gated)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn new_track(&self, class: TrackClass, label: String, tap: Option<AudioTap>) -> CaptureTrack {
        self.counters.slot(class).fetch_add(1, Ordering::SeqCst);
        self.opened_total.fetch_add(1, Ordering::SeqCst);
        let guard = SimTrackGuard {
            class,
            counters: Arc::clone(&self.counters),
        };
        CaptureTrack::new(class, label, tap, Some(Box::new(guard)))
    }
}

impl Default for SimulatedCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for SimulatedCaptureBackend {
    fn open_microphone(&self, quality: MediaQuality) -> Result<CaptureTrack, AcquisitionError> {
        self.wait_for_gate();
        if self.lock_state().microphone == Permission::Denied {
            return Err(AcquisitionError::PermissionDenied);
        }

        let tap = AudioTap::new();
        *self
            .microphone_tap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tap.clone());
        Ok(self.new_track(
            TrackClass::Microphone,
            format!("sim microphone ({quality:?})"),
            Some(tap),
        ))
    }

    fn open_camera(&self, quality: MediaQuality) -> Result<CaptureTrack, AcquisitionError> {
        self.wait_for_gate();
        {
            let mut state = self.lock_state();
            if state.camera == Permission::Denied {
                return Err(AcquisitionError::PermissionDenied);
            }
            if !state.camera_present {
                return Err(AcquisitionError::DeviceUnavailable);
            }
            if state.camera_transient_failures > 0 {
                state.camera_transient_failures -= 1;
                return Err(AcquisitionError::Transient(
                    "simulated camera failure".to_string(),
                ));
            }
        }

        Ok(self.new_track(TrackClass::Camera, format!("sim camera ({quality:?})"), None))
    }

    fn open_screen(
        &self,
        stop_hook: Arc<ExternalStopHook>,
    ) -> Result<Vec<CaptureTrack>, AcquisitionError> {
        // Registered before the gate: the OS stop-sharing surface exists as
        // soon as the capture is requested, not only once it is granted.
        self.screen_hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(stop_hook);

        self.wait_for_gate();
        if self.lock_state().screen == Permission::Denied {
            return Err(AcquisitionError::PermissionDenied);
        }

        Ok(vec![
            self.new_track(TrackClass::ScreenVideo, "sim screen video".to_string(), None),
            self.new_track(TrackClass::ScreenAudio, "sim screen audio".to_string(), None),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_microphone_reports_permission_error() {
        let backend = SimulatedCaptureBackend::new();
        backend.deny_microphone();
        let result = backend.open_microphone(MediaQuality::Standard);
        assert!(matches!(result, Err(AcquisitionError::PermissionDenied)));
        assert_eq!(backend.live_track_total(), 0);
    }

    #[test]
    fn transient_camera_failure_recovers_on_retry() {
        let backend = SimulatedCaptureBackend::new();
        backend.fail_camera_once();

        assert!(matches!(
            backend.open_camera(MediaQuality::Standard),
            Err(AcquisitionError::Transient(_))
        ));
        assert!(backend.open_camera(MediaQuality::Standard).is_ok());
    }

    #[test]
    fn microphone_samples_reach_the_track_tap() {
        let backend = SimulatedCaptureBackend::new();
        let track = backend
            .open_microphone(MediaQuality::Standard)
            .expect("opens microphone");

        backend.push_microphone_samples(&[0.5, -0.5, 0.25]);
        let mut drained = Vec::new();
        track.tap().expect("microphone has a tap").drain_into(&mut drained);
        assert_eq!(drained, vec![0.5, -0.5, 0.25]);
    }

    #[test]
    fn external_stop_fires_registered_hooks_once() {
        let backend = SimulatedCaptureBackend::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let hook = Arc::new(ExternalStopHook::new(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })));

        let _tracks = backend.open_screen(hook).expect("opens screen capture");
        backend.trigger_screen_external_stop();
        backend.trigger_screen_external_stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
