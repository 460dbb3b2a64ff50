// src/audio/peak_meter.rs
// Windowed peak-average metering shared between an audio thread and readers

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::level::meter_level;

/// Moving average of per-period peak values over a fixed window.
///
/// One real-time writer calls [`add_value`](Self::add_value) once per period;
/// any number of readers may call [`average`](Self::average).
#[derive(Debug)]
pub struct PeakAverage {
    slots: Box<[AtomicU32]>, // f32 bits
    next: AtomicUsize,
    filled: AtomicUsize,
}

impl PeakAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            slots: (0..window).map(|_| AtomicU32::new(0)).collect(),
            next: AtomicUsize::new(0),
            filled: AtomicUsize::new(0),
        }
    }

    pub fn window(&self) -> usize {
        self.slots.len()
    }

    /// Record one period's peak (call from the audio thread).
    pub fn add_value(&self, peak: f32) {
        let index = self.next.load(Ordering::Relaxed);
        self.slots[index].store(peak.abs().to_bits(), Ordering::Relaxed);
        self.next
            .store((index + 1) % self.slots.len(), Ordering::Relaxed);
        if self.filled.load(Ordering::Relaxed) < self.slots.len() {
            self.filled.fetch_add(1, Ordering::Release);
        }
    }

    /// Average of the recorded peaks, `0.0` before the first value.
    pub fn average(&self) -> f32 {
        let filled = self.filled.load(Ordering::Acquire).min(self.slots.len());
        if filled == 0 {
            return 0.0;
        }
        let sum: f32 = self.slots[..filled]
            .iter()
            .map(|slot| f32::from_bits(slot.load(Ordering::Relaxed)))
            .sum();
        sum / filled as f32
    }

    /// Current average as a meter reading in hundredths of a dB.
    pub fn level(&self) -> i32 {
        meter_level(self.average())
    }

    pub fn reset(&self) {
        self.filled.store(0, Ordering::Release);
        self.next.store(0, Ordering::Relaxed);
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// A left/right pair of meters.
pub type StereoMeter = [PeakAverage; 2];

pub fn stereo_meter(window: usize) -> StereoMeter {
    [PeakAverage::new(window), PeakAverage::new(window)]
}
