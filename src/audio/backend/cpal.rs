// src/audio/backend/cpal.rs
// Portable backend: cpal callback streams exposed as blocking PCM handles

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ::cpal::{
    BufferSize, BuildStreamError, Device, SizedSample, StreamConfig, StreamError,
    SupportedBufferSize, SupportedStreamConfigRange,
};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use crate::audio::error::PcmError;
use crate::audio::format::SampleFormat;
use crate::audio::lockfree_buffer::{RingReader, RingSlot, RingWriter, ring_buffer};
use crate::audio::pcm::{Backend, Direction, PcmDevice, PcmState};

/// Every device of the default cpal host, in enumeration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn device_at(index: usize) -> Option<Device> {
    ::cpal::default_host().devices().ok()?.nth(index)
}

impl Backend for CpalBackend {
    fn label(&self) -> &str {
        "cpal"
    }

    fn open(&self, index: usize, direction: Direction) -> Option<Box<dyn PcmDevice>> {
        let device = device_at(index)?;
        let ranges: Vec<SupportedStreamConfigRange> = match direction {
            Direction::Capture => device.supported_input_configs().ok()?.collect(),
            Direction::Playback => device.supported_output_configs().ok()?.collect(),
        };
        if ranges.is_empty() {
            return None;
        }
        let name = device
            .name()
            .unwrap_or_else(|_| format!("device {index}"));
        debug!(%name, ?direction, configs = ranges.len(), "cpal device opened");
        Some(Box::new(CpalPcm::new(name, Some(device), direction, ranges)))
    }

    fn card_name(&self, index: usize) -> Option<String> {
        device_at(index)?.name().ok()
    }
}

fn cpal_format(format: SampleFormat) -> ::cpal::SampleFormat {
    match format {
        SampleFormat::S16Le => ::cpal::SampleFormat::I16,
        SampleFormat::S32Le => ::cpal::SampleFormat::I32,
    }
}

/// State shared between a handle and its stream callbacks.
#[derive(Default)]
struct Shared {
    /// Filled by the input callback.
    capture: RingSlot<RingWriter>,
    /// Emptied by the output callback.
    playback: RingSlot<RingReader>,
    fault: AtomicBool,
    disconnected: AtomicBool,
}

fn stream_error(shared: &Shared, err: StreamError) {
    if matches!(err, StreamError::DeviceNotAvailable) {
        shared.disconnected.store(true, Ordering::Release);
    } else {
        shared.fault.store(true, Ordering::Release);
    }
}

/// Samples the callbacks move through the byte rings.
trait WireSample: SizedSample + Send + 'static {
    const BYTES: usize;
    fn put(self, out: &mut [u8]);
    fn get(bytes: &[u8]) -> Self;
}

impl WireSample for i16 {
    const BYTES: usize = 2;

    fn put(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn get(bytes: &[u8]) -> Self {
        i16::from_le_bytes([bytes[0], bytes[1]])
    }
}

impl WireSample for i32 {
    const BYTES: usize = 4;

    fn put(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn get(bytes: &[u8]) -> Self {
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

fn build_capture<T: WireSample>(
    device: &Device,
    config: &StreamConfig,
    shared: &Arc<Shared>,
) -> Result<::cpal::Stream, BuildStreamError> {
    let data_shared = Arc::clone(shared);
    let error_shared = Arc::clone(shared);
    // Grows to the callback size once, then stays put.
    let mut bytes = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &::cpal::InputCallbackInfo| {
            bytes.resize(data.len() * T::BYTES, 0);
            for (sample, out) in data.iter().zip(bytes.chunks_exact_mut(T::BYTES)) {
                sample.put(out);
            }
            let stored = data_shared
                .capture
                .try_with(|ring| {
                    ring.writable_bytes() >= bytes.len() && ring.write(&bytes) == bytes.len()
                })
                .unwrap_or(false);
            if !stored {
                data_shared.fault.store(true, Ordering::Release);
            }
        },
        move |err| stream_error(&error_shared, err),
        None,
    )
}

fn build_playback<T: WireSample>(
    device: &Device,
    config: &StreamConfig,
    shared: &Arc<Shared>,
) -> Result<::cpal::Stream, BuildStreamError> {
    let data_shared = Arc::clone(shared);
    let error_shared = Arc::clone(shared);
    let frame_bytes = config.channels as usize * T::BYTES;
    let mut bytes = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &::cpal::OutputCallbackInfo| {
            bytes.resize(data.len() * T::BYTES, 0);
            let read = data_shared
                .playback
                .try_with(|ring| ring.read_frames(&mut bytes, frame_bytes))
                .unwrap_or(0);
            bytes[read..].fill(0);
            for (sample, chunk) in data.iter_mut().zip(bytes.chunks_exact(T::BYTES)) {
                *sample = T::get(chunk);
            }
        },
        move |err| stream_error(&error_shared, err),
        None,
    )
}

fn build_stream(
    device: &Device,
    direction: Direction,
    config: &StreamConfig,
    format: SampleFormat,
    shared: &Arc<Shared>,
) -> Result<::cpal::Stream, BuildStreamError> {
    match (direction, format) {
        (Direction::Capture, SampleFormat::S16Le) => build_capture::<i16>(device, config, shared),
        (Direction::Capture, SampleFormat::S32Le) => build_capture::<i32>(device, config, shared),
        (Direction::Playback, SampleFormat::S16Le) => build_playback::<i16>(device, config, shared),
        (Direction::Playback, SampleFormat::S32Le) => build_playback::<i32>(device, config, shared),
    }
}

/// Owns the platform stream, which may not leave the thread that built it,
/// until the handle drops its stop sender.
fn keep_stream(
    device: Device,
    direction: Direction,
    config: StreamConfig,
    format: SampleFormat,
    shared: Arc<Shared>,
    ready: Sender<Result<(), String>>,
    stop: Receiver<()>,
) {
    let stream = build_stream(&device, direction, &config, format, &shared).or_else(|err| {
        debug!(%err, "fixed period rejected, using the device default");
        let fallback = StreamConfig {
            buffer_size: BufferSize::Default,
            ..config.clone()
        };
        build_stream(&device, direction, &fallback, format, &shared)
    });
    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(err.to_string()));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready.send(Err(err.to_string()));
        return;
    }
    let _ = ready.send(Ok(()));

    // Returns once the sender is gone.
    let _ = stop.recv();
    drop(stream);
    debug!(?direction, "cpal stream closed");
}

struct Keeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// One direction of a cpal device. Negotiation is answered from the
/// device's supported configuration ranges.
struct CpalPcm {
    name: String,
    device: Option<Device>,
    direction: Direction,
    ranges: Vec<SupportedStreamConfigRange>,
    format: Option<SampleFormat>,
    rate: u32,
    channels: u16,
    periods: u32,
    period_frames: usize,
    buffer_frames: usize,
    shared: Arc<Shared>,
    /// Handle-side ring ends; only the one matching `direction` is used.
    reader: Option<RingReader>,
    writer: Option<RingWriter>,
    keeper: Option<Keeper>,
    state: PcmState,
}

impl CpalPcm {
    fn new(
        name: String,
        device: Option<Device>,
        direction: Direction,
        ranges: Vec<SupportedStreamConfigRange>,
    ) -> Self {
        Self {
            name,
            device,
            direction,
            ranges,
            format: None,
            rate: 0,
            channels: 0,
            periods: 2,
            period_frames: 0,
            buffer_frames: 0,
            shared: Arc::default(),
            reader: None,
            writer: None,
            keeper: None,
            state: PcmState::Open,
        }
    }

    fn matching(&self) -> impl Iterator<Item = &SupportedStreamConfigRange> {
        let wanted = self.format.map(cpal_format);
        self.ranges
            .iter()
            .filter(move |range| Some(range.sample_format()) == wanted)
    }

    fn at_rate(&self) -> impl Iterator<Item = &SupportedStreamConfigRange> {
        let rate = self.rate;
        self.matching().filter(move |range| {
            (range.min_sample_rate().0..=range.max_sample_rate().0).contains(&rate)
        })
    }

    fn frame_bytes(&self) -> Result<usize, PcmError> {
        let format = self
            .format
            .ok_or_else(|| PcmError::Unsupported("format not set".to_string()))?;
        Ok(format.bytes_per_sample() * self.channels as usize)
    }

    fn take_fault(&mut self) -> Result<(), PcmError> {
        if self.shared.disconnected.load(Ordering::Acquire) {
            self.state = PcmState::Disconnected;
            return Err(PcmError::Disconnected);
        }
        if self.shared.fault.swap(false, Ordering::AcqRel) {
            self.state = PcmState::Xrun;
            return Err(PcmError::Xrun);
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        let micros = self.period_frames as u64 * 1_000_000 / self.rate.max(1) as u64;
        Duration::from_micros(micros / 4).max(Duration::from_micros(250))
    }

    fn io_timeout(&self) -> Duration {
        let micros = self.buffer_frames as u64 * 1_000_000 / self.rate.max(1) as u64;
        Duration::from_micros(micros * 2) + Duration::from_millis(100)
    }

    fn wait_until(&mut self, ready: impl Fn(&Self) -> bool) -> Result<(), PcmError> {
        let deadline = Instant::now() + self.io_timeout();
        let interval = self.poll_interval();
        loop {
            self.take_fault()?;
            if ready(self) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PcmError::Timeout);
            }
            thread::sleep(interval);
        }
    }
}

impl PcmDevice for CpalPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn supports_interleaved(&mut self) -> bool {
        // cpal only delivers interleaved buffers.
        true
    }

    fn supports_format(&mut self, format: SampleFormat) -> bool {
        let wanted = cpal_format(format);
        self.ranges.iter().any(|range| range.sample_format() == wanted)
    }

    fn set_format(&mut self, format: SampleFormat) -> Result<(), PcmError> {
        if !self.supports_format(format) {
            return Err(PcmError::Unsupported(format!("{format}")));
        }
        self.format = Some(format);
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, PcmError> {
        let nearest = self
            .matching()
            .map(|range| rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0))
            .min_by_key(|candidate| candidate.abs_diff(rate))
            .ok_or_else(|| PcmError::Unsupported("no sample rate for format".to_string()))?;
        self.rate = nearest;
        Ok(nearest)
    }

    fn set_channels_near(&mut self, channels: u16) -> Result<u16, PcmError> {
        let nearest = self
            .at_rate()
            .map(|range| range.channels())
            .min_by_key(|candidate| candidate.abs_diff(channels))
            .ok_or_else(|| PcmError::Unsupported("no channel layout at rate".to_string()))?;
        self.channels = nearest;
        Ok(nearest)
    }

    fn set_periods_near(&mut self, periods: u32) -> Result<u32, PcmError> {
        self.periods = periods.clamp(2, 16);
        Ok(self.periods)
    }

    fn set_buffer_size_near(&mut self, frames: usize) -> Result<usize, PcmError> {
        let wanted = (frames / self.periods as usize).max(1) as u32;
        let channels = self.channels;
        let period = self
            .at_rate()
            .find(|range| range.channels() == channels)
            .map_or(wanted, |range| match *range.buffer_size() {
                SupportedBufferSize::Range { min, max } => wanted.clamp(min, max.max(min)),
                SupportedBufferSize::Unknown => wanted,
            });
        self.period_frames = period as usize;
        self.buffer_frames = self.period_frames * self.periods as usize;
        Ok(self.buffer_frames)
    }

    fn apply_hw_params(&mut self) -> Result<(), PcmError> {
        let format = self
            .format
            .ok_or_else(|| PcmError::Unsupported("format not set".to_string()))?;
        let frame_bytes = self.frame_bytes()?;
        let device = self
            .device
            .take()
            .ok_or_else(|| PcmError::Unsupported("hardware parameters already applied".to_string()))?;

        match self.direction {
            Direction::Capture => {
                let (writer, reader) = ring_buffer(2 * self.buffer_frames * frame_bytes);
                self.shared.capture.install(writer);
                self.reader = Some(reader);
            }
            Direction::Playback => {
                let (writer, reader) = ring_buffer(self.buffer_frames * frame_bytes);
                self.shared.playback.install(reader);
                self.writer = Some(writer);
            }
        }

        let config = StreamConfig {
            channels: self.channels,
            sample_rate: ::cpal::SampleRate(self.rate),
            buffer_size: BufferSize::Fixed(self.period_frames as u32),
        };
        let (ready_tx, ready_rx) = channel::bounded(1);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let direction = self.direction;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("cae-cpal-{}", self.name))
            .spawn(move || keep_stream(device, direction, config, format, shared, ready_tx, stop_rx))
            .map_err(|err| PcmError::Io(err.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                let _ = handle.join();
                return Err(PcmError::Io(message));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PcmError::Disconnected);
            }
        }
        self.keeper = Some(Keeper {
            stop: stop_tx,
            handle,
        });
        self.state = PcmState::Prepared;
        Ok(())
    }

    fn set_avail_min(&mut self, _frames: usize) -> Result<(), PcmError> {
        Ok(())
    }

    fn read_interleaved(&mut self, buf: &mut [u8], frames: usize) -> Result<usize, PcmError> {
        let frame_bytes = self.frame_bytes()?;
        let wanted = (frames * frame_bytes).min(buf.len());
        let wanted = wanted - wanted % frame_bytes;
        self.wait_until(|pcm| {
            pcm.reader
                .as_ref()
                .is_some_and(|ring| ring.readable_bytes() >= wanted)
        })?;
        let read = self
            .reader
            .as_mut()
            .map_or(0, |ring| ring.read_frames(&mut buf[..wanted], frame_bytes));
        self.state = PcmState::Running;
        Ok(read / frame_bytes)
    }

    fn write_interleaved(&mut self, buf: &[u8], frames: usize) -> Result<usize, PcmError> {
        let frame_bytes = self.frame_bytes()?;
        let wanted = (frames * frame_bytes).min(buf.len());
        let wanted = wanted - wanted % frame_bytes;
        self.wait_until(|pcm| {
            pcm.writer
                .as_ref()
                .is_some_and(|ring| ring.writable_bytes() >= wanted)
        })?;
        let written = self
            .writer
            .as_mut()
            .map_or(0, |ring| ring.write(&buf[..wanted]));
        self.state = PcmState::Running;
        Ok(written / frame_bytes)
    }

    fn state(&self) -> PcmState {
        self.state
    }

    fn drop_and_prepare(&mut self) -> Result<(), PcmError> {
        if self.shared.disconnected.load(Ordering::Acquire) {
            return Err(PcmError::Disconnected);
        }
        self.shared.fault.store(false, Ordering::Release);
        match self.direction {
            Direction::Capture => {
                if let Some(reader) = self.reader.as_mut() {
                    reader.reset();
                }
            }
            Direction::Playback => {
                self.shared.playback.with(|reader| reader.reset());
            }
        }
        self.state = PcmState::Prepared;
        Ok(())
    }
}

impl Drop for CpalPcm {
    fn drop(&mut self) {
        if let Some(Keeper { stop, handle }) = self.keeper.take() {
            drop(stop);
            if handle.join().is_err() {
                warn!(name = %self.name, "cpal stream thread panicked");
            }
        }
    }
}
