// src/audio/negotiator.rs
// Hardware parameter negotiation for one direction of a card

use tracing::{info, warn};

use super::config::DriverConfig;
use super::error::NegotiationError;
use super::format::{PcmFormat, SampleFormat};
use super::pcm::PcmDevice;

/// What the driver asks the hardware for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub sample_rate: u32,
    pub rate_tolerance: u32,
    pub channels: u16,
    pub periods: u32,
    pub period_frames: usize,
}

impl FormatRequest {
    pub fn from_config(config: &DriverConfig, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            rate_tolerance: config.sample_rate_tolerance,
            channels: config.aggregate_channels(),
            periods: config.period_quantity,
            period_frames: config.period_size,
        }
    }
}

/// Negotiate access, encoding, rate, channels and period geometry, in that
/// order. Any failure rejects the device for the lifetime of the driver.
pub fn negotiate(
    pcm: &mut dyn PcmDevice,
    request: &FormatRequest,
) -> Result<PcmFormat, NegotiationError> {
    let device = pcm.name().to_string();

    if !pcm.supports_interleaved() {
        warn!(%device, "interleaved access not supported");
        return Err(NegotiationError::InterleavedUnsupported);
    }

    let Some(sample_format) = SampleFormat::PREFERENCE
        .into_iter()
        .find(|format| pcm.supports_format(*format))
    else {
        warn!(%device, "unsupported sample format");
        return Err(NegotiationError::NoSupportedFormat);
    };
    pcm.set_format(sample_format)?;
    info!(%device, "Format = {sample_format}");

    let sample_rate = pcm.set_rate_near(request.sample_rate)?;
    if sample_rate.abs_diff(request.sample_rate) > request.rate_tolerance {
        warn!(
            %device,
            requested = request.sample_rate,
            got = sample_rate,
            "sample rate out of tolerance"
        );
        return Err(NegotiationError::SampleRateOutOfTolerance {
            requested: request.sample_rate,
            got: sample_rate,
        });
    }
    info!(%device, "SampleRate = {sample_rate}");

    let channels = pcm.set_channels_near(request.channels)?;
    if channels < 2 {
        warn!(%device, channels, "too few channels");
        return Err(NegotiationError::TooFewChannels(channels));
    }
    info!(%device, "Aggregate Channels = {channels}");

    let periods = pcm.set_periods_near(request.periods.max(1))?.max(1);
    info!(%device, "Periods = {periods}");

    let buffer_frames =
        pcm.set_buffer_size_near(periods as usize * request.period_frames)?;
    info!(%device, "BufferSize = {buffer_frames} frames");

    pcm.apply_hw_params()?;

    let period_frames = (buffer_frames / periods as usize).max(1);
    pcm.set_avail_min(period_frames)?;

    Ok(PcmFormat {
        sample_format,
        sample_rate,
        channels,
        periods,
        buffer_frames,
        period_frames,
    })
}

/// Scratch memory an engine needs for one negotiated direction.
pub struct ScratchBuffers {
    /// One full hardware buffer of interleaved frames.
    pub hardware: Vec<u8>,
    /// Per-port staging for passthrough and record data.
    pub staging: Vec<u8>,
}

impl ScratchBuffers {
    pub fn for_format(format: &PcmFormat) -> Self {
        let size = format.buffer_bytes().max(format.period_frames * 8);
        Self {
            hardware: vec![0; size],
            staging: vec![0; size],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::memory::{MemoryBackend, MemoryCardSpec};
    use crate::audio::pcm::{Backend, Direction};

    fn request() -> FormatRequest {
        FormatRequest::from_config(&DriverConfig::default(), 48000)
    }

    fn negotiate_spec(spec: MemoryCardSpec) -> Result<PcmFormat, NegotiationError> {
        let (backend, _) = MemoryBackend::with_card(spec);
        let mut pcm = backend.open(0, Direction::Playback).unwrap();
        negotiate(pcm.as_mut(), &request())
    }

    #[test]
    fn test_prefers_32_bit() {
        let format = negotiate_spec(MemoryCardSpec::default()).unwrap();
        assert_eq!(format.sample_format, SampleFormat::S32Le);
        assert_eq!(format.sample_rate, 48000);
        assert_eq!(format.channels, 16);
        assert_eq!(format.periods, 4);
        assert_eq!(format.buffer_frames, 1024);
        assert_eq!(format.period_frames, 256);
    }

    #[test]
    fn test_falls_back_to_16_bit() {
        let spec = MemoryCardSpec {
            formats: vec![SampleFormat::S16Le],
            ..Default::default()
        };
        let format = negotiate_spec(spec).unwrap();
        assert_eq!(format.sample_format, SampleFormat::S16Le);
    }

    #[test]
    fn test_rejects_unsupported_format() {
        let spec = MemoryCardSpec {
            formats: vec![],
            ..Default::default()
        };
        assert!(matches!(
            negotiate_spec(spec),
            Err(NegotiationError::NoSupportedFormat)
        ));
    }

    #[test]
    fn test_rejects_non_interleaved() {
        let spec = MemoryCardSpec {
            interleaved: false,
            ..Default::default()
        };
        assert!(matches!(
            negotiate_spec(spec),
            Err(NegotiationError::InterleavedUnsupported)
        ));
    }

    #[test]
    fn test_rate_tolerance() {
        let near = MemoryCardSpec {
            rates: vec![48050],
            ..Default::default()
        };
        assert_eq!(negotiate_spec(near).unwrap().sample_rate, 48050);

        let far = MemoryCardSpec {
            rates: vec![44100],
            ..Default::default()
        };
        assert!(matches!(
            negotiate_spec(far),
            Err(NegotiationError::SampleRateOutOfTolerance {
                requested: 48000,
                got: 44100
            })
        ));
    }

    #[test]
    fn test_accepts_fewer_channels() {
        let spec = MemoryCardSpec {
            max_channels: 4,
            ..Default::default()
        };
        let format = negotiate_spec(spec).unwrap();
        assert_eq!(format.channels, 4);
        assert_eq!(format.ports(), 2);
    }

    #[test]
    fn test_scratch_sizes() {
        let format = negotiate_spec(MemoryCardSpec::default()).unwrap();
        let scratch = ScratchBuffers::for_format(&format);
        assert_eq!(scratch.hardware.len(), 1024 * 16 * 4);
        assert_eq!(scratch.staging.len(), scratch.hardware.len());
    }
}
