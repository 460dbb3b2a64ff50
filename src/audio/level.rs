// src/audio/level.rs
// Hundredths-of-dB levels, linear gain conversion and the shared gain cell

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Level at and below which a gain is fully muted and a meter reads silence.
pub const MUTE_LEVEL: i32 = -10000;

/// Unity gain in hundredths of a dB.
pub const UNITY_LEVEL: i32 = 0;

/// Convert a level in hundredths of a dB to a linear amplitude factor.
///
/// Anything at or below [`MUTE_LEVEL`] is exactly `0.0`; the exponential is
/// never evaluated there.
pub fn level_to_gain(level: i32) -> f32 {
    if level <= MUTE_LEVEL {
        0.0
    } else {
        10f64.powf(level as f64 / 2000.0) as f32
    }
}

/// Convert a linear peak value to a meter reading in hundredths of a dB,
/// floored at [`MUTE_LEVEL`].
pub fn meter_level(linear: f32) -> i32 {
    if linear.is_nan() || linear <= 0.0 {
        return MUTE_LEVEL;
    }
    let level = (2000.0 * (linear as f64).log10()).round();
    if level <= MUTE_LEVEL as f64 {
        MUTE_LEVEL
    } else {
        level as i32
    }
}

/// Clamp a requested gain level into `MUTE_LEVEL..=UNITY_LEVEL`.
pub fn clamp_level(level: i32) -> i32 {
    level.clamp(MUTE_LEVEL, UNITY_LEVEL)
}

/// A gain published from the control side to a real-time thread.
///
/// Holds both the level and the precomputed linear factor so the audio thread
/// never evaluates `powf`.
#[derive(Debug)]
pub struct GainCell {
    level: AtomicI32,
    linear: AtomicU32, // f32 bits
}

impl GainCell {
    pub fn new(level: i32) -> Self {
        let level = clamp_level(level);
        Self {
            level: AtomicI32::new(level),
            linear: AtomicU32::new(level_to_gain(level).to_bits()),
        }
    }

    pub fn muted() -> Self {
        Self::new(MUTE_LEVEL)
    }

    pub fn unity() -> Self {
        Self::new(UNITY_LEVEL)
    }

    pub fn level(&self) -> i32 {
        self.level.load(Ordering::Acquire)
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.linear.load(Ordering::Acquire))
    }

    pub fn is_muted(&self) -> bool {
        self.gain() == 0.0
    }

    /// Publish a new level. Returns `false` when the level was already set,
    /// leaving the linear factor untouched.
    pub fn set_level(&self, level: i32) -> bool {
        let level = clamp_level(level);
        if self.level.swap(level, Ordering::AcqRel) == level {
            return false;
        }
        self.linear
            .store(level_to_gain(level).to_bits(), Ordering::Release);
        true
    }
}

impl Default for GainCell {
    fn default() -> Self {
        Self::unity()
    }
}
