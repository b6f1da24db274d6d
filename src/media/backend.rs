use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::AcquisitionError;

/// Roughly one second of audio at 48kHz. Anything the monitor has not drained
/// by then is stale and gets dropped.
const MAX_TAP_SAMPLES: usize = 48_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackClass {
    Microphone,
    Camera,
    ScreenVideo,
    ScreenAudio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaQuality {
    #[default]
    Standard,
    /// Low-bandwidth capture profile (reduced resolution / frame rate).
    Reduced,
}

pub type ExternalStopFn = Box<dyn Fn() + Send + Sync>;

/// One-shot hook for screen captures that are stopped outside the
/// application's own controls (OS-level "stop sharing"). Fires at most once
/// no matter how many times the backend reports the stop.
pub struct ExternalStopHook {
    fired: AtomicBool,
    callback: Mutex<Option<ExternalStopFn>>,
}

impl ExternalStopHook {
    pub fn new(callback: ExternalStopFn) -> Self {
        Self {
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        }
    }

    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ExternalStopHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalStopHook")
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// Read-side tap on a capture track's audio. The producer (audio callback or
/// test feed) pushes mono samples; the voice activity monitor drains them.
#[derive(Debug, Clone, Default)]
pub struct AudioTap {
    buffer: Arc<Mutex<Vec<f32>>>,
    dropped_samples: Arc<AtomicU64>,
}

impl AudioTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_samples(&self, samples: &[f32]) {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let room = MAX_TAP_SAMPLES.saturating_sub(buffer.len());
        if samples.len() > room {
            self.dropped_samples
                .fetch_add((samples.len() - room) as u64, Ordering::Relaxed);
        }
        buffer.extend_from_slice(&samples[..samples.len().min(room)]);
    }

    pub fn drain_into(&self, target: &mut Vec<f32>) {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        target.append(&mut buffer);
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }
}

/// Owner of the underlying capture resource; dropped exactly once when the
/// track stops.
pub trait TrackGuard: Send {
    fn shut_down(&mut self);
}

/// A single live capture track. Stop is idempotent; `enabled` mutes without
/// tearing the resource down so re-enable is instantaneous.
pub struct CaptureTrack {
    class: TrackClass,
    label: String,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    tap: Option<AudioTap>,
    guard: Option<Box<dyn TrackGuard>>,
}

impl CaptureTrack {
    pub fn new(
        class: TrackClass,
        label: impl Into<String>,
        tap: Option<AudioTap>,
        guard: Option<Box<dyn TrackGuard>>,
    ) -> Self {
        Self {
            class,
            label: label.into(),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            tap,
            guard,
        }
    }

    pub fn class(&self) -> TrackClass {
        self.class
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn tap(&self) -> Option<&AudioTap> {
        self.tap.as_ref()
    }

    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut guard) = self.guard.take() {
            guard.shut_down();
        }
        log::debug!("capture track stopped: class={:?} label={}", self.class, self.label);
    }
}

impl Drop for CaptureTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CaptureTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureTrack")
            .field("class", &self.class)
            .field("label", &self.label)
            .field("enabled", &self.enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Seam between the resource manager and the platform. The system backend
/// talks to real devices; the simulated backend scripts every outcome so the
/// session logic can be exercised deterministically.
pub trait CaptureBackend: Send + Sync {
    fn open_microphone(&self, quality: MediaQuality) -> Result<CaptureTrack, AcquisitionError>;

    fn open_camera(&self, quality: MediaQuality) -> Result<CaptureTrack, AcquisitionError>;

    /// Opens the screen capture bundle (video and, where supported, audio).
    /// The hook must fire exactly once if the capture is terminated outside
    /// the application.
    fn open_screen(
        &self,
        stop_hook: Arc<ExternalStopHook>,
    ) -> Result<Vec<CaptureTrack>, AcquisitionError>;
}
