// src/audio/io.rs
// Media sources and sinks: hound WAV, encoder hook and rubato resampling

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::error::{DriverError, MediaError};

/// Encoding of a recording, numbered as on the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Pcm16,
    MpegLayer2,
    Pcm24,
}

impl Coding {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Coding::Pcm16),
            2 => Some(Coding::MpegLayer2),
            4 => Some(Coding::Pcm24),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Coding::Pcm16 => 0,
            Coding::MpegLayer2 => 2,
            Coding::Pcm24 => 4,
        }
    }
}

/// Parameters of a `load_record` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRequest {
    pub coding: Coding,
    pub channels: u16,
    pub sample_rate: u32,
    /// Bits per second, only meaningful for compressed codings.
    pub bit_rate: u32,
}

impl RecordRequest {
    pub fn pcm16(channels: u16, sample_rate: u32) -> Self {
        Self {
            coding: Coding::Pcm16,
            channels,
            sample_rate,
            bit_rate: 0,
        }
    }
}

/// Decoded audio feeding one playback stream, as interleaved 16-bit samples.
pub trait PlaybackSource: Send {
    fn channels(&self) -> u16;
    fn sample_rate(&self) -> u32;
    fn length_frames(&self) -> u64;
    /// Fill `out` with interleaved samples; returns the count written, `0` at
    /// end of data.
    fn read(&mut self, out: &mut [i16]) -> Result<usize, MediaError>;
    fn seek(&mut self, frame: u64) -> Result<(), MediaError>;
}

/// Destination of one recording, fed interleaved 16-bit samples.
pub trait RecordSink: Send {
    fn write(&mut self, samples: &[i16]) -> Result<(), MediaError>;
    fn finalize(self: Box<Self>) -> Result<(), MediaError>;
}

/// Opens playback media. The default opener handles WAV; decoders for
/// compressed content plug in here.
pub trait MediaOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PlaybackSource>, MediaError>;
}

/// Creates sinks for compressed codings such as MPEG Layer II.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, path: &Path, request: &RecordRequest) -> Result<Box<dyn RecordSink>, MediaError>;
}

pub struct WavOpener;

impl MediaOpener for WavOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PlaybackSource>, MediaError> {
        Ok(Box::new(WavSource::open(path)?))
    }
}

/// WAV file reader normalizing every supported encoding to 16 bits.
pub struct WavSource {
    reader: WavReader<BufReader<File>>,
    spec: WavSpec,
    length_frames: u64,
}

impl WavSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MediaError> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();

        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 8 | 16 | 24 | 32) | (SampleFormat::Float, 32) => {}
            (format, bits) => {
                return Err(MediaError::UnsupportedEncoding(format!(
                    "{bits}-bit {format:?}"
                )));
            }
        }

        let length_frames = reader.duration() as u64;
        Ok(Self {
            reader,
            spec,
            length_frames,
        })
    }
}

impl PlaybackSource for WavSource {
    fn channels(&self) -> u16 {
        self.spec.channels
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn length_frames(&self) -> u64 {
        self.length_frames
    }

    fn read(&mut self, out: &mut [i16]) -> Result<usize, MediaError> {
        let mut count = 0;
        match self.spec.sample_format {
            SampleFormat::Float => {
                for (slot, sample) in out.iter_mut().zip(self.reader.samples::<f32>()) {
                    *slot = (sample? * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
                    count += 1;
                }
            }
            SampleFormat::Int => {
                let bits = self.spec.bits_per_sample;
                for (slot, sample) in out.iter_mut().zip(self.reader.samples::<i32>()) {
                    let sample = sample?;
                    *slot = match bits {
                        8 => (sample << 8) as i16,
                        16 => sample as i16,
                        24 => (sample >> 8) as i16,
                        _ => (sample >> 16) as i16,
                    };
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn seek(&mut self, frame: u64) -> Result<(), MediaError> {
        let frame = u32::try_from(frame.min(self.length_frames)).unwrap_or(u32::MAX);
        self.reader.seek(frame)?;
        Ok(())
    }
}

/// PCM16 or PCM24 WAV recording.
pub struct WavSink {
    writer: WavWriter<BufWriter<File>>,
    coding: Coding,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(path: P, request: &RecordRequest) -> Result<Self, MediaError> {
        let bits_per_sample = match request.coding {
            Coding::Pcm16 => 16,
            Coding::Pcm24 => 24,
            Coding::MpegLayer2 => {
                return Err(MediaError::UnsupportedEncoding(
                    "MPEG Layer II in a WAV sink".to_string(),
                ));
            }
        };
        let spec = WavSpec {
            channels: request.channels,
            sample_rate: request.sample_rate,
            bits_per_sample,
            sample_format: SampleFormat::Int,
        };
        Ok(Self {
            writer: WavWriter::create(path, spec)?,
            coding: request.coding,
        })
    }
}

impl RecordSink for WavSink {
    fn write(&mut self, samples: &[i16]) -> Result<(), MediaError> {
        for &sample in samples {
            match self.coding {
                Coding::Pcm24 => self.writer.write_sample((sample as i32) << 8)?,
                _ => self.writer.write_sample(sample)?,
            }
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<(), MediaError> {
        self.writer.finalize()?;
        Ok(())
    }
}

/// Validate a record request and open its sink.
pub fn create_sink(
    path: &Path,
    request: &RecordRequest,
    encoder: Option<&dyn EncoderFactory>,
) -> Result<Box<dyn RecordSink>, DriverError> {
    if !(1..=2).contains(&request.channels) {
        return Err(DriverError::UnsupportedChannels(request.channels));
    }
    match request.coding {
        Coding::Pcm16 | Coding::Pcm24 => Ok(Box::new(WavSink::create(path, request)?)),
        Coding::MpegLayer2 => match encoder {
            Some(factory) => Ok(factory.create(path, request)?),
            None => Err(DriverError::UnsupportedCoding(request.coding)),
        },
    }
}

/// Chunked sinc resampler converting a source rate to the device rate.
///
/// Output is delay-compensated and trimmed so that `n` input frames yield
/// `ceil(n * ratio)` output frames once flushed.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    ratio: f64,
    channels: usize,
    input: Vec<Vec<f32>>,
    frames_in: u64,
    frames_out: u64,
    skip: usize,
}

const RESAMPLER_CHUNK: usize = 1024;
const MAX_TAIL_CHUNKS: usize = 4;

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self, MediaError> {
        let ratio = to_rate as f64 / from_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK, channels)
            .map_err(|e| MediaError::Resample(e.to_string()))?;
        let skip = resampler.output_delay();
        Ok(Self {
            resampler,
            ratio,
            channels,
            input: vec![Vec::with_capacity(RESAMPLER_CHUNK * 2); channels],
            frames_in: 0,
            frames_out: 0,
            skip,
        })
    }

    /// Queue interleaved samples and append any resampled output to `out`.
    pub fn push(&mut self, samples: &[i16], out: &mut Vec<i16>) -> Result<(), MediaError> {
        for frame in samples.chunks_exact(self.channels) {
            for (channel, &sample) in self.input.iter_mut().zip(frame) {
                channel.push(sample as f32 / 32768.0);
            }
            self.frames_in += 1;
        }
        loop {
            let needed = self.resampler.input_frames_next();
            if self.input[0].len() < needed {
                return Ok(());
            }
            let output = self
                .resampler
                .process(&self.input, None)
                .map_err(|e| MediaError::Resample(e.to_string()))?;
            for channel in &mut self.input {
                channel.drain(..needed);
            }
            self.emit(&output, out, None);
        }
    }

    /// Resample whatever is queued plus the filter tail.
    pub fn flush(&mut self, out: &mut Vec<i16>) -> Result<(), MediaError> {
        let expected = (self.frames_in as f64 * self.ratio).ceil() as u64;
        if !self.input[0].is_empty() {
            let output = self
                .resampler
                .process_partial(Some(self.input.as_slice()), None)
                .map_err(|e| MediaError::Resample(e.to_string()))?;
            for channel in &mut self.input {
                channel.clear();
            }
            self.emit(&output, out, Some(expected));
        }
        for _ in 0..MAX_TAIL_CHUNKS {
            if self.frames_out >= expected {
                break;
            }
            let tail = self
                .resampler
                .process_partial::<Vec<f32>>(None, None)
                .map_err(|e| MediaError::Resample(e.to_string()))?;
            self.emit(&tail, out, Some(expected));
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
        for channel in &mut self.input {
            channel.clear();
        }
        self.frames_in = 0;
        self.frames_out = 0;
        self.skip = self.resampler.output_delay();
    }

    fn emit(&mut self, channels: &[Vec<f32>], out: &mut Vec<i16>, limit: Option<u64>) {
        let frames = channels.first().map_or(0, Vec::len);
        let start = self.skip.min(frames);
        self.skip -= start;
        let end = match limit {
            Some(limit) => frames.min(start + limit.saturating_sub(self.frames_out) as usize),
            None => frames,
        };
        for frame in start..end {
            for channel in channels {
                out.push((channel[frame] * 32768.0).round().clamp(-32768.0, 32767.0) as i16);
            }
        }
        self.frames_out += (end - start) as u64;
    }
}
