//! Platform capture backend. The microphone is a real cpal input stream
//! hosted on a dedicated thread so every handle in the crate stays `Send`.
//! Camera and screen tracks carry full lifecycle and ownership but no frames:
//! the stack has no video-capture library, and the trait seam keeps them
//! swappable for a backend that does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, StreamConfig};

use super::backend::{
    AudioTap, CaptureBackend, CaptureTrack, ExternalStopHook, MediaQuality, TrackClass, TrackGuard,
};
use super::AcquisitionError;

const CLIP_THRESHOLD: f32 = 0.995;
const CAPTURE_THREAD_NAME: &str = "beacon-mic-capture";

#[derive(Default)]
struct CaptureStats {
    clipped_frames: AtomicU64,
    delivered_chunks: AtomicU64,
}

pub struct SystemCaptureBackend;

impl SystemCaptureBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for SystemCaptureBackend {
    fn open_microphone(&self, quality: MediaQuality) -> Result<CaptureTrack, AcquisitionError> {
        let tap = AudioTap::new();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let thread_tap = tap.clone();
        thread::Builder::new()
            .name(CAPTURE_THREAD_NAME.to_string())
            .spawn(move || run_microphone_thread(thread_tap, ready_tx, stop_rx))
            .map_err(|err| {
                AcquisitionError::Backend(format!("failed to spawn capture thread: {err}"))
            })?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(AcquisitionError::Backend(
                    "capture thread exited before reporting readiness".to_string(),
                ))
            }
        };

        log::info!("microphone capture started: device=\"{device_name}\" quality={quality:?}");
        Ok(CaptureTrack::new(
            TrackClass::Microphone,
            device_name,
            Some(tap),
            Some(Box::new(MicThreadGuard { stop_tx })),
        ))
    }

    fn open_camera(&self, quality: MediaQuality) -> Result<CaptureTrack, AcquisitionError> {
        // Lifecycle-only track; see module docs.
        log::info!("camera track opened (placeholder, quality={quality:?})");
        Ok(CaptureTrack::new(
            TrackClass::Camera,
            format!("system camera ({quality:?})"),
            None,
            None,
        ))
    }

    fn open_screen(
        &self,
        _stop_hook: Arc<ExternalStopHook>,
    ) -> Result<Vec<CaptureTrack>, AcquisitionError> {
        // No OS stop-sharing integration on this backend, so the hook can
        // never fire here; the track lifecycle is still owned and released
        // like any other capture.
        log::info!("screen capture opened (placeholder)");
        Ok(vec![CaptureTrack::new(
            TrackClass::ScreenVideo,
            "system screen".to_string(),
            None,
            None,
        )])
    }
}

struct MicThreadGuard {
    stop_tx: mpsc::Sender<()>,
}

impl TrackGuard for MicThreadGuard {
    fn shut_down(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

fn run_microphone_thread(
    tap: AudioTap,
    ready_tx: mpsc::Sender<Result<String, AcquisitionError>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let stats = Arc::new(CaptureStats::default());
    let (stream, device_name) = match build_microphone_stream(tap, Arc::clone(&stats)) {
        Ok(built) => built,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(AcquisitionError::Backend(format!(
            "failed to start input stream: {err}"
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(device_name.clone()));

    // Parked until the track (or its guard) goes away; the stream must be
    // dropped on this thread.
    let _ = stop_rx.recv();
    drop(stream);
    log::info!(
        "microphone capture stopped: device=\"{}\" clipped_frames={} delivered_chunks={}",
        device_name,
        stats.clipped_frames.load(Ordering::Relaxed),
        stats.delivered_chunks.load(Ordering::Relaxed),
    );
}

fn build_microphone_stream(
    tap: AudioTap,
    stats: Arc<CaptureStats>,
) -> Result<(cpal::Stream, String), AcquisitionError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AcquisitionError::DeviceUnavailable)?;
    let device_name = device
        .name()
        .unwrap_or_else(|_| "Unknown Input".to_string());
    let supported = device.default_input_config().map_err(|err| {
        AcquisitionError::Backend(format!("failed to query default input config: {err}"))
    })?;
    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();
    let channels = usize::from(stream_config.channels);

    let err_fn = move |err| {
        log::warn!("input stream error: {err}");
    };

    let stream = match sample_format {
        SampleFormat::I16 => {
            build_input_stream::<i16>(&device, &stream_config, channels, tap, stats, err_fn)?
        }
        SampleFormat::I32 => {
            build_input_stream::<i32>(&device, &stream_config, channels, tap, stats, err_fn)?
        }
        SampleFormat::U16 => {
            build_input_stream::<u16>(&device, &stream_config, channels, tap, stats, err_fn)?
        }
        SampleFormat::F32 => {
            build_input_stream::<f32>(&device, &stream_config, channels, tap, stats, err_fn)?
        }
        other => {
            return Err(AcquisitionError::Backend(format!(
                "unsupported input sample format: {other:?}"
            )));
        }
    };

    Ok((stream, device_name))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    tap: AudioTap,
    stats: Arc<CaptureStats>,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AcquisitionError>
where
    T: Sample + cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                if channels == 0 {
                    return;
                }

                let frames = data.len() / channels;
                let mut mono = Vec::with_capacity(frames);
                for frame in data.chunks(channels) {
                    let (mixed, clipped) =
                        mix_frame_to_mono(frame.iter().map(|&raw| f32::from_sample(raw)));
                    mono.push(mixed);
                    if clipped {
                        stats.clipped_frames.fetch_add(1, Ordering::Relaxed);
                    }
                }

                tap.push_samples(&mono);
                stats.delivered_chunks.fetch_add(1, Ordering::Relaxed);
            },
            err_fn,
            None,
        )
        .map_err(|err| AcquisitionError::Backend(format!("failed to build input stream: {err}")))
}

/// Averages one interleaved frame down to a single sample. Every channel
/// contributes, whatever the device's channel count.
fn mix_frame_to_mono(frame: impl Iterator<Item = f32>) -> (f32, bool) {
    let mut sum = 0.0_f32;
    let mut count = 0_usize;
    let mut clipped = false;
    for value in frame {
        clipped = clipped || value.abs() >= CLIP_THRESHOLD;
        sum += value;
        count += 1;
    }
    if count == 0 {
        return (0.0, false);
    }
    (sum / count as f32, clipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_mixdown_averages_channels() {
        let (mixed, clipped) = mix_frame_to_mono([0.5, -0.1].into_iter());
        assert!((mixed - 0.2).abs() < 1e-6);
        assert!(!clipped);
    }

    #[test]
    fn mixdown_flags_clipped_frames() {
        let (_, clipped) = mix_frame_to_mono([0.2, 0.999].into_iter());
        assert!(clipped);
    }

    #[test]
    fn empty_frame_mixes_to_silence() {
        assert_eq!(mix_frame_to_mono(std::iter::empty()), (0.0, false));
    }

    #[test]
    fn mixdown_hears_channels_past_the_sixteenth() {
        // 16 silent channels followed by 8 hot ones; a mixdown that stops at
        // 16 would read this frame as silence.
        let mut frame = vec![0.0_f32; 16];
        frame.extend(std::iter::repeat(0.3).take(8));
        let (mixed, clipped) = mix_frame_to_mono(frame.into_iter());
        assert!((mixed - 0.1).abs() < 1e-6);
        assert!(!clipped);
    }

    #[test]
    fn placeholder_camera_track_has_full_lifecycle() {
        let backend = SystemCaptureBackend::new();
        let mut track = backend
            .open_camera(MediaQuality::Reduced)
            .expect("opens placeholder camera");
        assert_eq!(track.class(), TrackClass::Camera);
        assert!(!track.is_stopped());
        track.stop();
        assert!(track.is_stopped());
    }
}
