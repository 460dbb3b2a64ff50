// src/audio/error.rs
// Error types for devices, negotiation, media and the driver facade

use std::path::PathBuf;

use thiserror::Error;

use super::io::Coding;

/// Failure reported by a hardware PCM handle.
#[derive(Debug, Error)]
pub enum PcmError {
    #[error("buffer xrun")]
    Xrun,
    #[error("device disconnected")]
    Disconnected,
    #[error("timed out waiting for device")]
    Timeout,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device i/o: {0}")]
    Io(String),
}

/// Why a device was rejected during hardware parameter negotiation.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("interleaved access is not supported")]
    InterleavedUnsupported,
    #[error("neither S32_LE nor S16_LE is supported")]
    NoSupportedFormat,
    #[error("sample rate {got} Hz is outside tolerance of requested {requested} Hz")]
    SampleRateOutOfTolerance { requested: u32, got: u32 },
    #[error("device offers {0} channel(s), at least one stereo pair is required")]
    TooFewChannels(u16),
    #[error(transparent)]
    Device(#[from] PcmError),
}

/// Container or codec failure while opening, reading or writing media.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("wav: {0}")]
    Wav(#[from] hound::Error),
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("resampler: {0}")]
    Resample(String),
    #[error("codec: {0}")]
    Codec(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Error returned by every driver facade operation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no such card {0}")]
    NoSuchCard(usize),
    #[error("card {card}: invalid port {port}")]
    InvalidPort { card: usize, port: usize },
    #[error("card {card}: invalid stream {stream}")]
    InvalidStream { card: usize, stream: usize },
    #[error("card {0}: no free stream")]
    NoFreeStream(usize),
    #[error("card {0}: no capture device")]
    NoCaptureDevice(usize),
    #[error("card {0}: no playback device")]
    NoPlaybackDevice(usize),
    #[error("card {card}: stream {stream} is not loaded")]
    NotLoaded { card: usize, stream: usize },
    #[error("card {card}: stream {stream} is already playing")]
    AlreadyPlaying { card: usize, stream: usize },
    #[error("unsupported playback speed {0}")]
    UnsupportedSpeed(u32),
    #[error("card {card}: port {port} has no recording loaded")]
    NotArmed { card: usize, port: usize },
    #[error("card {card}: port {port} already has a recording session")]
    RecordBusy { card: usize, port: usize },
    #[error("unsupported coding {0:?}")]
    UnsupportedCoding(Coding),
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u16),
    #[error("record sample rate {requested} Hz does not match capture rate {device} Hz")]
    SampleRateMismatch { requested: u32, device: u32 },
    #[error("seek to {position_ms} ms is beyond length {length_ms} ms")]
    SeekOutOfRange { position_ms: u32, length_ms: u32 },
    #[error("backend '{0}' is not available in this build")]
    BackendUnavailable(&'static str),
    #[error("card {0} is not running in freewheel mode")]
    NotFreewheel(usize),
    #[error("spawning engine thread: {0}")]
    Spawn(std::io::Error),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type DriverResult<T> = Result<T, DriverError>;
