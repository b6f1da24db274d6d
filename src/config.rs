use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_CONFIG_DIR: &str = "Beacon";
const TUNING_FILE: &str = "call-tuning.json";
const DEV_TUNING_FILE: &str = "dev-call-tuning.json";
const DEV_TUNING_ENV: &str = "BEACON_CALL_TUNING";

/// Tuning knobs for the call session. Every field has a compiled default; an
/// override file is optional and read-only (the subsystem never persists it).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallTuning {
    #[serde(default = "default_vad_tick_ms")]
    pub vad_tick_ms: u64,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    #[serde(default = "default_remote_activity_tick_ms")]
    pub remote_activity_tick_ms: u64,
    #[serde(default = "default_remote_activity_probability")]
    pub remote_activity_probability: f64,
    #[serde(default = "default_pickup_delay_ms")]
    pub pickup_delay_ms: u64,
    #[serde(default = "default_ringback_chord_hz")]
    pub ringback_chord_hz: Vec<f32>,
    #[serde(default = "default_ringback_detune_cents")]
    pub ringback_detune_cents: f32,
    #[serde(default = "default_ringback_ramp_up_ms")]
    pub ringback_ramp_up_ms: u64,
    #[serde(default = "default_ringback_ramp_down_ms")]
    pub ringback_ramp_down_ms: u64,
    #[serde(default = "default_ringback_cycle_ms")]
    pub ringback_cycle_ms: u64,
    #[serde(default = "default_ringback_gain")]
    pub ringback_gain: f32,
}

impl Default for CallTuning {
    fn default() -> Self {
        Self {
            vad_tick_ms: default_vad_tick_ms(),
            vad_threshold: default_vad_threshold(),
            remote_activity_tick_ms: default_remote_activity_tick_ms(),
            remote_activity_probability: default_remote_activity_probability(),
            pickup_delay_ms: default_pickup_delay_ms(),
            ringback_chord_hz: default_ringback_chord_hz(),
            ringback_detune_cents: default_ringback_detune_cents(),
            ringback_ramp_up_ms: default_ringback_ramp_up_ms(),
            ringback_ramp_down_ms: default_ringback_ramp_down_ms(),
            ringback_cycle_ms: default_ringback_cycle_ms(),
            ringback_gain: default_ringback_gain(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read tuning file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse tuning file {path}: {source}")]
    ParseFile {
        path: String,
        source: serde_json::Error,
    },
}

/// Resolves tuning in override order: env var path, dev file in the working
/// directory, persistent config dir, compiled defaults.
pub fn load_tuning() -> Result<CallTuning, ConfigError> {
    let Some(path) = find_tuning_file() else {
        return Ok(CallTuning::default());
    };
    read_tuning(&path)
}

fn read_tuning(path: &Path) -> Result<CallTuning, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
        path: path.display().to_string(),
        source,
    })
}

fn find_tuning_file() -> Option<PathBuf> {
    if let Ok(path_from_env) = std::env::var(DEV_TUNING_ENV) {
        let from_env = PathBuf::from(path_from_env);
        if from_env.exists() {
            return Some(from_env);
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let direct = cwd.join(DEV_TUNING_FILE);
        if direct.exists() {
            return Some(direct);
        }
    }

    let persistent = dirs::config_dir()?.join(APP_CONFIG_DIR).join(TUNING_FILE);
    if persistent.exists() {
        return Some(persistent);
    }

    None
}

const fn default_vad_tick_ms() -> u64 {
    80
}

const fn default_vad_threshold() -> f32 {
    0.015
}

const fn default_remote_activity_tick_ms() -> u64 {
    2_000
}

const fn default_remote_activity_probability() -> f64 {
    0.7
}

const fn default_pickup_delay_ms() -> u64 {
    4_000
}

fn default_ringback_chord_hz() -> Vec<f32> {
    // G major; close enough to the classic ringback register.
    vec![392.0, 493.88, 587.33]
}

const fn default_ringback_detune_cents() -> f32 {
    5.0
}

const fn default_ringback_ramp_up_ms() -> u64 {
    2_000
}

const fn default_ringback_ramp_down_ms() -> u64 {
    2_000
}

const fn default_ringback_cycle_ms() -> u64 {
    4_500
}

const fn default_ringback_gain() -> f32 {
    0.28
}
