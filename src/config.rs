use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::nes::apu::{DEFAULT_SAMPLE_RATE, MIN_SAMPLE_RATE};

/// NTSC frame rate (master clock / (341 * 262 - 0.5) / 4).
pub const NTSC_FRAME_RATE_HZ: f64 = 60.098_813_897_440_515;

/// Host and core settings. Every field is optional in JSON; missing ones
/// fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Output rate of the sample callback, in Hz.
    pub sample_rate: u32,
    /// Target rate for the host thread when pacing.
    pub frame_rate_hz: f64,
    /// Sleep between frames to hold `frame_rate_hz`. Off runs flat out.
    pub pace: bool,
    /// Frames the host buffers before dropping new ones.
    pub frame_queue_depth: usize,
    /// Samples per chunk sent by the host.
    pub sample_chunk: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_rate_hz: NTSC_FRAME_RATE_HZ,
            pace: true,
            frame_queue_depth: 3,
            sample_chunk: 512,
        }
    }
}

impl EmulatorConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("invalid emulator config")?;
        Ok(config.sanitized())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate_hz)
    }

    fn sanitized(mut self) -> Self {
        self.sample_rate = self.sample_rate.max(MIN_SAMPLE_RATE);
        if !self.frame_rate_hz.is_finite() || self.frame_rate_hz <= 0.0 {
            self.frame_rate_hz = NTSC_FRAME_RATE_HZ;
        }
        self.frame_queue_depth = self.frame_queue_depth.max(1);
        self.sample_chunk = self.sample_chunk.max(1);
        self
    }
}
