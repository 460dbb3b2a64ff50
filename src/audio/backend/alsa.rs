// src/audio/backend/alsa.rs
// Direct ALSA backend with blocking interleaved I/O

use ::alsa::pcm::{Access, Format, Frames, HwParams, PCM, State};
use ::alsa::{Direction as AlsaDirection, ValueOr};
use tracing::debug;

use crate::audio::config::DriverConfig;
use crate::audio::error::PcmError;
use crate::audio::format::SampleFormat;
use crate::audio::pcm::{Backend, Direction, PcmDevice, PcmState};

const ENODEV: i32 = 19;
const EPIPE: i32 = 32;
const ESTRPIPE: i32 = 86;

fn pcm_error(err: ::alsa::Error) -> PcmError {
    match err.errno() {
        EPIPE | ESTRPIPE => PcmError::Xrun,
        ENODEV => PcmError::Disconnected,
        _ => PcmError::Io(err.to_string()),
    }
}

fn alsa_format(format: SampleFormat) -> Format {
    match format {
        SampleFormat::S16Le => Format::S16LE,
        SampleFormat::S32Le => Format::S32LE,
    }
}

/// Opens `alsa_device_pattern` devices, one card per index.
pub struct AlsaBackend {
    config: DriverConfig,
}

impl AlsaBackend {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }
}

impl Backend for AlsaBackend {
    fn label(&self) -> &str {
        "alsa"
    }

    fn open(&self, index: usize, direction: Direction) -> Option<Box<dyn PcmDevice>> {
        let name = self.config.alsa_device_name(index);
        let dir = match direction {
            Direction::Capture => AlsaDirection::Capture,
            Direction::Playback => AlsaDirection::Playback,
        };
        match PCM::new(&name, dir, false) {
            Ok(pcm) => Some(Box::new(AlsaPcm {
                label: format!("{name} ({direction:?})"),
                pcm,
                direction,
                format: None,
                rate: 0,
                channels: 0,
                periods: 0,
                buffer_frames: 0,
            })),
            Err(err) => {
                debug!(%name, ?direction, %err, "alsa open failed");
                None
            }
        }
    }

    fn card_name(&self, index: usize) -> Option<String> {
        let card = ::alsa::card::Card::new(index as i32);
        card.get_longname()
            .ok()
            .or_else(|| Some(self.config.alsa_device_name(index)))
    }
}

/// Hardware parameters are staged: every setter rebuilds the full
/// configuration space and re-applies the choices made so far.
struct AlsaPcm {
    label: String,
    pcm: PCM,
    direction: Direction,
    format: Option<SampleFormat>,
    rate: u32,
    channels: u32,
    periods: u32,
    buffer_frames: usize,
}

impl AlsaPcm {
    fn staged(&self) -> Result<HwParams<'_>, ::alsa::Error> {
        let hwp = HwParams::any(&self.pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        if let Some(format) = self.format {
            hwp.set_format(alsa_format(format))?;
        }
        if self.rate > 0 {
            hwp.set_rate(self.rate, ValueOr::Nearest)?;
        }
        if self.channels > 0 {
            hwp.set_channels(self.channels)?;
        }
        if self.periods > 0 {
            hwp.set_periods(self.periods, ValueOr::Nearest)?;
        }
        Ok(hwp)
    }

    fn frame_bytes(&self) -> Result<usize, PcmError> {
        let format = self
            .format
            .ok_or_else(|| PcmError::Unsupported("format not set".to_string()))?;
        Ok(format.bytes_per_sample() * self.channels as usize)
    }
}

impl PcmDevice for AlsaPcm {
    fn name(&self) -> &str {
        &self.label
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn supports_interleaved(&mut self) -> bool {
        HwParams::any(&self.pcm)
            .and_then(|hwp| hwp.set_access(Access::RWInterleaved))
            .is_ok()
    }

    fn supports_format(&mut self, format: SampleFormat) -> bool {
        self.staged()
            .and_then(|hwp| hwp.set_format(alsa_format(format)))
            .is_ok()
    }

    fn set_format(&mut self, format: SampleFormat) -> Result<(), PcmError> {
        self.staged()
            .and_then(|hwp| hwp.set_format(alsa_format(format)))
            .map_err(pcm_error)?;
        self.format = Some(format);
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, PcmError> {
        let got = self
            .staged()
            .and_then(|hwp| hwp.set_rate_near(rate, ValueOr::Nearest))
            .map_err(pcm_error)?;
        self.rate = got;
        Ok(got)
    }

    fn set_channels_near(&mut self, channels: u16) -> Result<u16, PcmError> {
        let got = self
            .staged()
            .and_then(|hwp| hwp.set_channels_near(channels as u32))
            .map_err(pcm_error)?;
        self.channels = got;
        Ok(got.min(u16::MAX as u32) as u16)
    }

    fn set_periods_near(&mut self, periods: u32) -> Result<u32, PcmError> {
        let got = self
            .staged()
            .and_then(|hwp| {
                hwp.set_periods(periods, ValueOr::Nearest)?;
                hwp.get_periods()
            })
            .map_err(pcm_error)?;
        self.periods = got;
        Ok(got)
    }

    fn set_buffer_size_near(&mut self, frames: usize) -> Result<usize, PcmError> {
        let got = self
            .staged()
            .and_then(|hwp| hwp.set_buffer_size_near(frames as Frames))
            .map_err(pcm_error)?;
        self.buffer_frames = got.max(0) as usize;
        Ok(self.buffer_frames)
    }

    fn apply_hw_params(&mut self) -> Result<(), PcmError> {
        let hwp = self.staged().map_err(pcm_error)?;
        hwp.set_buffer_size_near(self.buffer_frames as Frames)
            .map_err(pcm_error)?;
        self.pcm.hw_params(&hwp).map_err(pcm_error)
    }

    fn set_avail_min(&mut self, frames: usize) -> Result<(), PcmError> {
        let swp = self.pcm.sw_params_current().map_err(pcm_error)?;
        swp.set_avail_min(frames as Frames).map_err(pcm_error)?;
        self.pcm.sw_params(&swp).map_err(pcm_error)
    }

    fn read_interleaved(&mut self, buf: &mut [u8], frames: usize) -> Result<usize, PcmError> {
        let len = (frames * self.frame_bytes()?).min(buf.len());
        self.pcm.io_bytes().readi(&mut buf[..len]).map_err(pcm_error)
    }

    fn write_interleaved(&mut self, buf: &[u8], frames: usize) -> Result<usize, PcmError> {
        let len = (frames * self.frame_bytes()?).min(buf.len());
        self.pcm.io_bytes().writei(&buf[..len]).map_err(pcm_error)
    }

    fn state(&self) -> PcmState {
        match self.pcm.state() {
            State::Prepared => PcmState::Prepared,
            State::Running => PcmState::Running,
            State::XRun => PcmState::Xrun,
            State::Draining => PcmState::Draining,
            State::Paused => PcmState::Paused,
            State::Suspended => PcmState::Suspended,
            State::Disconnected => PcmState::Disconnected,
            _ => PcmState::Open,
        }
    }

    fn drop_and_prepare(&mut self) -> Result<(), PcmError> {
        self.pcm.drop().map_err(pcm_error)?;
        self.pcm.prepare().map_err(pcm_error)
    }
}
