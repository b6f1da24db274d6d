pub mod backend;
pub mod simulated;
pub mod system;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

pub use backend::{
    AudioTap, CaptureBackend, CaptureTrack, ExternalStopFn, ExternalStopHook, MediaQuality,
    TrackClass,
};
pub use simulated::SimulatedCaptureBackend;
pub use system::SystemCaptureBackend;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("permission to use the capture device was denied")]
    PermissionDenied,
    #[error("no matching capture device is available")]
    DeviceUnavailable,
    #[error("transient capture failure: {0}")]
    Transient(String),
    #[error("a device handle of this class is already held")]
    AlreadyHeld,
    #[error("capture backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireKind {
    AudioOnly,
    AudioVideo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleClass {
    CallMedia,
    ScreenShare,
}

struct HandleInner {
    class: HandleClass,
    tracks: Mutex<Vec<CaptureTrack>>,
    released: AtomicBool,
}

impl HandleInner {
    fn lock_tracks(&self) -> MutexGuard<'_, Vec<CaptureTrack>> {
        self.tracks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tracks = self.lock_tracks();
        for track in tracks.iter_mut() {
            track.stop();
        }
        tracks.clear();
    }
}

/// Reference to one exclusively-held capture resource bundle. Cloning shares
/// the same underlying handle; only the [`MediaResourceManager`] creates and
/// releases it. Release is idempotent.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl DeviceHandle {
    fn new(class: HandleClass, tracks: Vec<CaptureTrack>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                class,
                tracks: Mutex::new(tracks),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn class(&self) -> HandleClass {
        self.inner.class
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Mutes or unmutes the microphone track in place. The track is never
    /// destroyed by this path, so re-enabling is instantaneous.
    pub fn set_audio_enabled(&self, enabled: bool) {
        let tracks = self.inner.lock_tracks();
        for track in tracks.iter() {
            if track.class() == TrackClass::Microphone {
                track.set_enabled(enabled);
            }
        }
    }

    pub fn audio_enabled(&self) -> bool {
        let tracks = self.inner.lock_tracks();
        tracks
            .iter()
            .find(|track| track.class() == TrackClass::Microphone)
            .map(|track| track.enabled())
            .unwrap_or(false)
    }

    pub fn has_live_video(&self) -> bool {
        let tracks = self.inner.lock_tracks();
        tracks.iter().any(|track| {
            matches!(track.class(), TrackClass::Camera | TrackClass::ScreenVideo)
                && !track.is_stopped()
        })
    }

    /// Read-only sample tap for the voice activity monitor. Draining a
    /// released or videoless handle yields nothing and never fails.
    pub fn drain_audio(&self, target: &mut Vec<f32>) {
        let tracks = self.inner.lock_tracks();
        for track in tracks.iter() {
            if track.class() != TrackClass::Microphone {
                continue;
            }
            if let Some(tap) = track.tap() {
                tap.drain_into(target);
            }
        }
    }

    fn same_handle(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("class", &self.inner.class)
            .field("released", &self.is_released())
            .finish()
    }
}

#[derive(Default)]
struct Slots {
    call: Option<DeviceHandle>,
    call_pending: bool,
    screen: Option<DeviceHandle>,
    screen_pending: bool,
}

/// Canonical owner of all capture devices for a call. At most one call-media
/// handle and one screen-share handle exist at a time; the controller holds
/// references but never performs device teardown itself.
pub struct MediaResourceManager {
    backend: Arc<dyn CaptureBackend>,
    slots: Mutex<Slots>,
}

impl MediaResourceManager {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(Slots::default()),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquires microphone (always) and camera (for `AudioVideo`). Nothing is
    /// left half-open on failure.
    pub fn acquire(
        &self,
        kind: AcquireKind,
        quality: MediaQuality,
    ) -> Result<DeviceHandle, AcquisitionError> {
        {
            let mut slots = self.lock_slots();
            if slots.call.is_some() || slots.call_pending {
                return Err(AcquisitionError::AlreadyHeld);
            }
            slots.call_pending = true;
        }

        let result = self.open_call_media(kind, quality);

        let mut slots = self.lock_slots();
        slots.call_pending = false;
        let handle = result?;
        slots.call = Some(handle.clone());
        log::info!("call media acquired: kind={kind:?} quality={quality:?}");
        Ok(handle)
    }

    fn open_call_media(
        &self,
        kind: AcquireKind,
        quality: MediaQuality,
    ) -> Result<DeviceHandle, AcquisitionError> {
        let microphone = self.backend.open_microphone(quality)?;
        let mut tracks = vec![microphone];

        if kind == AcquireKind::AudioVideo {
            match self.backend.open_camera(quality) {
                Ok(camera) => tracks.push(camera),
                Err(err) => {
                    for track in tracks.iter_mut() {
                        track.stop();
                    }
                    return Err(err);
                }
            }
        }

        Ok(DeviceHandle::new(HandleClass::CallMedia, tracks))
    }

    /// Adds a camera track to an existing audio-only handle. On failure the
    /// handle is exactly as it was; the error is the caller's to surface.
    pub fn upgrade_to_video(
        &self,
        handle: &DeviceHandle,
        quality: MediaQuality,
    ) -> Result<(), AcquisitionError> {
        if handle.class() != HandleClass::CallMedia || handle.is_released() {
            return Err(AcquisitionError::Transient(
                "call media handle is not live".to_string(),
            ));
        }
        if handle.has_live_video() {
            return Ok(());
        }

        let camera = self.backend.open_camera(quality)?;
        handle.inner.lock_tracks().push(camera);
        log::info!("call media upgraded to video");
        Ok(())
    }

    /// Stops and removes only the camera track. Local and infallible; the
    /// audio track is untouched.
    pub fn downgrade_from_video(&self, handle: &DeviceHandle) {
        if handle.class() != HandleClass::CallMedia {
            return;
        }
        let mut tracks = handle.inner.lock_tracks();
        for track in tracks.iter_mut() {
            if track.class() == TrackClass::Camera {
                track.stop();
            }
        }
        tracks.retain(|track| track.class() != TrackClass::Camera);
        log::info!("call media downgraded to audio only");
    }

    /// Acquires the independent screen-share bundle. `on_external_stop` fires
    /// exactly once if the user ends the capture through a non-application
    /// surface.
    pub fn acquire_screen_share(
        &self,
        on_external_stop: ExternalStopFn,
    ) -> Result<DeviceHandle, AcquisitionError> {
        {
            let mut slots = self.lock_slots();
            if slots.screen.is_some() || slots.screen_pending {
                return Err(AcquisitionError::AlreadyHeld);
            }
            slots.screen_pending = true;
        }

        let hook = Arc::new(ExternalStopHook::new(on_external_stop));
        let result = self.backend.open_screen(hook);

        let mut slots = self.lock_slots();
        slots.screen_pending = false;
        let tracks = result?;
        let handle = DeviceHandle::new(HandleClass::ScreenShare, tracks);
        slots.screen = Some(handle.clone());
        log::info!("screen share acquired");
        Ok(handle)
    }

    /// Idempotent: stops every track in the handle and clears its slot.
    pub fn release(&self, handle: &DeviceHandle) {
        handle.inner.release();

        let mut slots = self.lock_slots();
        if slots
            .call
            .as_ref()
            .is_some_and(|held| held.same_handle(handle))
        {
            slots.call = None;
        }
        if slots
            .screen
            .as_ref()
            .is_some_and(|held| held.same_handle(handle))
        {
            slots.screen = None;
        }
    }

    /// Single-path teardown used by call cleanup.
    pub fn release_all(&self) {
        let (call, screen) = {
            let mut slots = self.lock_slots();
            (slots.call.take(), slots.screen.take())
        };
        if let Some(handle) = call {
            handle.inner.release();
        }
        if let Some(handle) = screen {
            handle.inner.release();
        }
    }

    pub fn holds_call_media(&self) -> bool {
        self.lock_slots().call.is_some()
    }

    pub fn holds_screen_share(&self) -> bool {
        self.lock_slots().screen.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_sim() -> (MediaResourceManager, Arc<SimulatedCaptureBackend>) {
        let backend = Arc::new(SimulatedCaptureBackend::new());
        let manager = MediaResourceManager::new(Arc::clone(&backend) as Arc<dyn CaptureBackend>);
        (manager, backend)
    }

    #[test]
    fn acquire_audio_only_requests_microphone_without_camera() {
        let (manager, backend) = manager_with_sim();
        let handle = manager
            .acquire(AcquireKind::AudioOnly, MediaQuality::Standard)
            .expect("acquires audio");

        assert!(handle.audio_enabled());
        assert!(!handle.has_live_video());
        assert_eq!(backend.live_tracks(TrackClass::Microphone), 1);
        assert_eq!(backend.live_tracks(TrackClass::Camera), 0);
    }

    #[test]
    fn second_acquire_of_same_class_is_rejected() {
        let (manager, _backend) = manager_with_sim();
        let _held = manager
            .acquire(AcquireKind::AudioOnly, MediaQuality::Standard)
            .expect("first acquire succeeds");

        let second = manager.acquire(AcquireKind::AudioVideo, MediaQuality::Standard);
        assert!(matches!(second, Err(AcquisitionError::AlreadyHeld)));
    }

    #[test]
    fn failed_video_acquire_leaks_no_microphone() {
        let (manager, backend) = manager_with_sim();
        backend.remove_camera();

        let result = manager.acquire(AcquireKind::AudioVideo, MediaQuality::Standard);
        assert!(matches!(result, Err(AcquisitionError::DeviceUnavailable)));
        assert_eq!(backend.live_tracks(TrackClass::Microphone), 0);
        assert!(!manager.holds_call_media());
    }

    #[test]
    fn upgrade_failure_leaves_handle_audio_only() {
        let (manager, backend) = manager_with_sim();
        let handle = manager
            .acquire(AcquireKind::AudioOnly, MediaQuality::Standard)
            .expect("acquires audio");
        handle.set_audio_enabled(false);
        backend.fail_camera_once();

        let upgraded = manager.upgrade_to_video(&handle, MediaQuality::Standard);
        assert!(matches!(upgraded, Err(AcquisitionError::Transient(_))));
        assert!(!handle.has_live_video());
        assert!(!handle.audio_enabled(), "audio mute state must survive");
        assert!(!handle.is_released());
    }

    #[test]
    fn downgrade_preserves_audio_track_state() {
        let (manager, backend) = manager_with_sim();
        let handle = manager
            .acquire(AcquireKind::AudioVideo, MediaQuality::Standard)
            .expect("acquires video call media");
        assert!(handle.has_live_video());

        manager.downgrade_from_video(&handle);
        assert!(!handle.has_live_video());
        assert!(handle.audio_enabled());
        assert_eq!(backend.live_tracks(TrackClass::Camera), 0);
        assert_eq!(backend.live_tracks(TrackClass::Microphone), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let (manager, backend) = manager_with_sim();
        let handle = manager
            .acquire(AcquireKind::AudioOnly, MediaQuality::Standard)
            .expect("acquires audio");

        manager.release(&handle);
        manager.release(&handle);
        assert!(handle.is_released());
        assert_eq!(backend.live_tracks(TrackClass::Microphone), 0);
        assert!(!manager.holds_call_media());

        // A fresh acquire is a new attempt, not a resurrection.
        let again = manager
            .acquire(AcquireKind::AudioOnly, MediaQuality::Standard)
            .expect("re-acquire succeeds after release");
        assert!(!again.same_handle(&handle));
    }

    #[test]
    fn screen_share_is_independent_of_call_media() {
        let (manager, backend) = manager_with_sim();
        let call = manager
            .acquire(AcquireKind::AudioOnly, MediaQuality::Standard)
            .expect("acquires call media");
        let screen = manager
            .acquire_screen_share(Box::new(|| {}))
            .expect("acquires screen share");

        manager.release(&screen);
        assert!(!call.is_released());
        assert_eq!(backend.live_tracks(TrackClass::Microphone), 1);
        assert_eq!(backend.live_tracks(TrackClass::ScreenVideo), 0);
    }

    #[test]
    fn release_all_clears_both_slots() {
        let (manager, backend) = manager_with_sim();
        let _call = manager
            .acquire(AcquireKind::AudioVideo, MediaQuality::Standard)
            .expect("acquires call media");
        let _screen = manager
            .acquire_screen_share(Box::new(|| {}))
            .expect("acquires screen share");

        manager.release_all();
        assert!(!manager.holds_call_media());
        assert!(!manager.holds_screen_share());
        assert_eq!(backend.live_track_total(), 0);
    }

    #[test]
    fn permission_denied_microphone_propagates() {
        let (manager, backend) = manager_with_sim();
        backend.deny_microphone();

        let result = manager.acquire(AcquireKind::AudioOnly, MediaQuality::Standard);
        assert!(matches!(result, Err(AcquisitionError::PermissionDenied)));
        assert!(!manager.holds_call_media());
    }
}
