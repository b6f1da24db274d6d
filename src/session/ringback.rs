//! Procedural ringback tone. A small chord is detuned slightly on every
//! start, shaped by a swelling envelope, and looped on the default output
//! device until the call connects or the window is minimized.

use std::sync::mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use rand::Rng;

use crate::config::CallTuning;

const RINGBACK_THREAD_NAME: &str = "beacon-ringback";

/// Envelope over one ringback cycle: a linear swell, a linear fade, then
/// silence until the cycle repeats.
pub fn envelope_gain(cycle_pos_ms: f64, ramp_up_ms: f64, ramp_down_ms: f64, cycle_ms: f64) -> f32 {
    if cycle_ms <= 0.0 {
        return 0.0;
    }
    let pos = cycle_pos_ms.rem_euclid(cycle_ms);
    if pos < ramp_up_ms {
        if ramp_up_ms <= 0.0 {
            return 1.0;
        }
        (pos / ramp_up_ms) as f32
    } else if pos < ramp_up_ms + ramp_down_ms {
        if ramp_down_ms <= 0.0 {
            return 0.0;
        }
        (1.0 - (pos - ramp_up_ms) / ramp_down_ms) as f32
    } else {
        0.0
    }
}

pub fn detuned_frequency(base_hz: f32, cents: f32) -> f32 {
    base_hz * 2.0_f32.powf(cents / 1200.0)
}

struct Oscillator {
    frequency_hz: f32,
    phase: f32,
}

/// Sample-by-sample tone generator. Pure state machine so the audible shape
/// can be asserted without an output device.
pub struct ToneRenderer {
    oscillators: Vec<Oscillator>,
    sample_rate: f32,
    position: u64,
    ramp_up_ms: f64,
    ramp_down_ms: f64,
    cycle_ms: f64,
    gain: f32,
}

impl ToneRenderer {
    pub fn new(tuning: &CallTuning, sample_rate: f32, detune_offsets_cents: &[f32]) -> Self {
        let oscillators = tuning
            .ringback_chord_hz
            .iter()
            .enumerate()
            .map(|(index, &base)| Oscillator {
                frequency_hz: detuned_frequency(
                    base,
                    detune_offsets_cents.get(index).copied().unwrap_or(0.0),
                ),
                phase: 0.0,
            })
            .collect();

        Self {
            oscillators,
            sample_rate,
            position: 0,
            ramp_up_ms: tuning.ringback_ramp_up_ms as f64,
            ramp_down_ms: tuning.ringback_ramp_down_ms as f64,
            cycle_ms: tuning.ringback_cycle_ms as f64,
            gain: tuning.ringback_gain,
        }
    }

    pub fn next_sample(&mut self) -> f32 {
        let elapsed_ms = self.position as f64 * 1_000.0 / self.sample_rate as f64;
        let envelope = envelope_gain(elapsed_ms, self.ramp_up_ms, self.ramp_down_ms, self.cycle_ms);
        self.position += 1;

        if self.oscillators.is_empty() || envelope == 0.0 {
            // Phase keeps advancing implicitly from silence; restart of the
            // cycle is what matters, not oscillator continuity.
            return 0.0;
        }

        let mut mixed = 0.0_f32;
        for osc in self.oscillators.iter_mut() {
            mixed += (osc.phase * std::f32::consts::TAU).sin();
            osc.phase = (osc.phase + osc.frequency_hz / self.sample_rate).fract();
        }
        mixed / self.oscillators.len() as f32 * envelope * self.gain
    }
}

/// Owns the ringback output stream. `is_running` tracks intent: a machine
/// with no output device still "rings", it is just inaudible.
pub struct RingbackSynth {
    tuning: CallTuning,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl RingbackSynth {
    pub fn new(tuning: CallTuning) -> Self {
        Self {
            tuning,
            stop_tx: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    /// Starts the tone from silence. Calling while already running is a
    /// no-op; the current cycle is not restarted.
    pub fn start(&mut self) {
        if self.stop_tx.is_some() {
            return;
        }

        let detune = self.tuning.ringback_detune_cents.abs();
        let mut rng = rand::thread_rng();
        let offsets: Vec<f32> = self
            .tuning
            .ringback_chord_hz
            .iter()
            .map(|_| {
                if detune > 0.0 {
                    rng.gen_range(-detune..=detune)
                } else {
                    0.0
                }
            })
            .collect();

        let (stop_tx, stop_rx) = mpsc::channel();
        let tuning = self.tuning.clone();
        let spawned = thread::Builder::new()
            .name(RINGBACK_THREAD_NAME.to_string())
            .spawn(move || run_ringback_thread(tuning, offsets, stop_rx));
        match spawned {
            Ok(_) => {
                self.stop_tx = Some(stop_tx);
                log::debug!("ringback started");
            }
            Err(err) => {
                log::warn!("failed to spawn ringback thread: {err}");
            }
        }
    }

    /// Idempotent. The next `start` rebuilds the tone from silence.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
            log::debug!("ringback stopped");
        }
    }
}

impl Drop for RingbackSynth {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_ringback_thread(tuning: CallTuning, offsets: Vec<f32>, stop_rx: mpsc::Receiver<()>) {
    let stream = match build_ringback_stream(&tuning, &offsets) {
        Ok(stream) => Some(stream),
        Err(reason) => {
            // Degrade silently; the call flow does not depend on audio out.
            log::warn!("ringback unavailable: {reason}");
            None
        }
    };

    let _ = stop_rx.recv();
    drop(stream);
}

fn build_ringback_stream(tuning: &CallTuning, offsets: &[f32]) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no default output device".to_string())?;
    let supported = device
        .default_output_config()
        .map_err(|err| format!("failed to query default output config: {err}"))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let renderer = ToneRenderer::new(tuning, config.sample_rate.0 as f32, offsets);

    let stream = match sample_format {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config, renderer)?,
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config, renderer)?,
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config, renderer)?,
        other => return Err(format!("unsupported output sample format: {other:?}")),
    };
    stream
        .play()
        .map_err(|err| format!("failed to start output stream: {err}"))?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut renderer: ToneRenderer,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = usize::from(config.channels).max(1);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                for frame in data.chunks_mut(channels) {
                    let sample = renderer.next_sample();
                    for slot in frame.iter_mut() {
                        *slot = T::from_sample(sample);
                    }
                }
            },
            |err| log::warn!("output stream error: {err}"),
            None,
        )
        .map_err(|err| format!("failed to build output stream: {err}"))
}
