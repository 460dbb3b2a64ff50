// src/audio/backend/memory.rs
// In-memory PCM device with scriptable capabilities

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::error::PcmError;
use crate::audio::format::SampleFormat;
use crate::audio::pcm::{Backend, Direction, PcmDevice, PcmState};

/// Upper bound on buffered playback output before the oldest bytes are dropped.
const MAX_PLAYBACK_BYTES: usize = 16 * 1024 * 1024;

/// What a simulated card supports.
#[derive(Debug, Clone)]
pub struct MemoryCardSpec {
    pub name: String,
    pub formats: Vec<SampleFormat>,
    pub rates: Vec<u32>,
    pub max_channels: u16,
    pub interleaved: bool,
    pub capture: bool,
    pub playback: bool,
    /// Sleep for one period on every read and write, like blocking hardware.
    pub paced: bool,
}

impl Default for MemoryCardSpec {
    fn default() -> Self {
        Self {
            name: "Memory Card".to_string(),
            formats: vec![SampleFormat::S32Le, SampleFormat::S16Le],
            rates: vec![44100, 48000],
            max_channels: 16,
            interleaved: true,
            capture: true,
            playback: true,
            paced: false,
        }
    }
}

#[derive(Default)]
struct CardShared {
    capture_queue: Mutex<VecDeque<u8>>,
    playback_output: Mutex<VecDeque<u8>>,
    capture_xrun: AtomicBool,
    playback_xrun: AtomicBool,
    recoveries: AtomicUsize,
}

/// Test-side handle onto a simulated card.
#[derive(Clone)]
pub struct MemoryCardHandle {
    shared: Arc<CardShared>,
}

impl MemoryCardHandle {
    /// Queue interleaved bytes to be returned by subsequent capture reads.
    pub fn push_capture(&self, bytes: &[u8]) {
        self.shared.capture_queue.lock().extend(bytes.iter().copied());
    }

    /// Take everything written to the playback side so far.
    pub fn take_playback(&self) -> Vec<u8> {
        self.shared.playback_output.lock().drain(..).collect()
    }

    /// Make the next I/O call in `direction` fail with an xrun.
    pub fn inject_xrun(&self, direction: Direction) {
        match direction {
            Direction::Capture => self.shared.capture_xrun.store(true, Ordering::Release),
            Direction::Playback => self.shared.playback_xrun.store(true, Ordering::Release),
        }
    }

    /// Number of drop+prepare cycles performed in either direction.
    pub fn recoveries(&self) -> usize {
        self.shared.recoveries.load(Ordering::Acquire)
    }
}

/// Backend whose cards exist only in memory.
#[derive(Default)]
pub struct MemoryBackend {
    cards: Vec<(MemoryCardSpec, Arc<CardShared>)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_card(&mut self, spec: MemoryCardSpec) -> MemoryCardHandle {
        let shared = Arc::new(CardShared::default());
        self.cards.push((spec, Arc::clone(&shared)));
        MemoryCardHandle { shared }
    }

    pub fn with_card(spec: MemoryCardSpec) -> (Self, MemoryCardHandle) {
        let mut backend = Self::new();
        let handle = backend.add_card(spec);
        (backend, handle)
    }
}

impl Backend for MemoryBackend {
    fn label(&self) -> &str {
        "memory"
    }

    fn open(&self, index: usize, direction: Direction) -> Option<Box<dyn PcmDevice>> {
        let (spec, shared) = self.cards.get(index)?;
        let present = match direction {
            Direction::Capture => spec.capture,
            Direction::Playback => spec.playback,
        };
        if !present {
            return None;
        }
        Some(Box::new(MemoryPcm {
            name: format!("{} ({:?})", spec.name, direction),
            spec: spec.clone(),
            shared: Arc::clone(shared),
            direction,
            format: None,
            rate: 0,
            channels: 0,
            periods: 0,
            buffer_frames: 0,
            state: PcmState::Open,
        }))
    }

    fn card_name(&self, index: usize) -> Option<String> {
        self.cards.get(index).map(|(spec, _)| spec.name.clone())
    }
}

struct MemoryPcm {
    name: String,
    spec: MemoryCardSpec,
    shared: Arc<CardShared>,
    direction: Direction,
    format: Option<SampleFormat>,
    rate: u32,
    channels: u16,
    periods: u32,
    buffer_frames: usize,
    state: PcmState,
}

impl MemoryPcm {
    fn bytes_per_frame(&self) -> Result<usize, PcmError> {
        let format = self
            .format
            .ok_or_else(|| PcmError::Unsupported("format not set".to_string()))?;
        Ok(format.bytes_per_sample() * self.channels as usize)
    }

    fn take_xrun(&self) -> bool {
        let flag = match self.direction {
            Direction::Capture => &self.shared.capture_xrun,
            Direction::Playback => &self.shared.playback_xrun,
        };
        flag.swap(false, Ordering::AcqRel)
    }

    fn pace(&self, frames: usize) {
        if self.spec.paced && self.rate > 0 {
            let micros = frames as u64 * 1_000_000 / self.rate as u64;
            std::thread::sleep(Duration::from_micros(micros));
        }
    }
}

impl PcmDevice for MemoryPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn supports_interleaved(&mut self) -> bool {
        self.spec.interleaved
    }

    fn supports_format(&mut self, format: SampleFormat) -> bool {
        self.spec.formats.contains(&format)
    }

    fn set_format(&mut self, format: SampleFormat) -> Result<(), PcmError> {
        if !self.spec.formats.contains(&format) {
            return Err(PcmError::Unsupported(format!("{format}")));
        }
        self.format = Some(format);
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, PcmError> {
        let nearest = self
            .spec
            .rates
            .iter()
            .copied()
            .min_by_key(|r| r.abs_diff(rate))
            .ok_or_else(|| PcmError::Unsupported("no sample rates".to_string()))?;
        self.rate = nearest;
        Ok(nearest)
    }

    fn set_channels_near(&mut self, channels: u16) -> Result<u16, PcmError> {
        self.channels = channels.clamp(1, self.spec.max_channels.max(1));
        Ok(self.channels)
    }

    fn set_periods_near(&mut self, periods: u32) -> Result<u32, PcmError> {
        self.periods = periods.clamp(2, 64);
        Ok(self.periods)
    }

    fn set_buffer_size_near(&mut self, frames: usize) -> Result<usize, PcmError> {
        let minimum = self.periods.max(1) as usize;
        self.buffer_frames = frames.max(minimum);
        Ok(self.buffer_frames)
    }

    fn apply_hw_params(&mut self) -> Result<(), PcmError> {
        self.bytes_per_frame()?;
        self.state = PcmState::Prepared;
        Ok(())
    }

    fn set_avail_min(&mut self, _frames: usize) -> Result<(), PcmError> {
        Ok(())
    }

    fn read_interleaved(&mut self, buf: &mut [u8], frames: usize) -> Result<usize, PcmError> {
        let frame_bytes = self.bytes_per_frame()?;
        if self.take_xrun() {
            self.state = PcmState::Xrun;
            return Err(PcmError::Xrun);
        }
        self.pace(frames);

        let wanted = (frames * frame_bytes).min(buf.len());
        let mut queue = self.shared.capture_queue.lock();
        let available = queue.len().min(wanted);
        for (dst, src) in buf[..available].iter_mut().zip(queue.drain(..available)) {
            *dst = src;
        }
        buf[available..wanted].fill(0);

        self.state = PcmState::Running;
        Ok(wanted / frame_bytes)
    }

    fn write_interleaved(&mut self, buf: &[u8], frames: usize) -> Result<usize, PcmError> {
        let frame_bytes = self.bytes_per_frame()?;
        if self.take_xrun() {
            self.state = PcmState::Xrun;
            return Err(PcmError::Xrun);
        }
        self.pace(frames);

        let len = (frames * frame_bytes).min(buf.len());
        let mut output = self.shared.playback_output.lock();
        output.extend(buf[..len].iter().copied());
        let excess = output.len().saturating_sub(MAX_PLAYBACK_BYTES);
        output.drain(..excess);

        self.state = PcmState::Running;
        Ok(len / frame_bytes)
    }

    fn state(&self) -> PcmState {
        self.state
    }

    fn drop_and_prepare(&mut self) -> Result<(), PcmError> {
        self.shared.recoveries.fetch_add(1, Ordering::AcqRel);
        self.state = PcmState::Prepared;
        Ok(())
    }
}
