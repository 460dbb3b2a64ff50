// src/audio/pcm.rs
// Hardware PCM abstraction shared by every backend

use super::error::PcmError;
use super::format::SampleFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Capture,
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    Open,
    Prepared,
    Running,
    Xrun,
    Draining,
    Paused,
    Suspended,
    Disconnected,
}

/// One direction of one hardware device.
///
/// The negotiation calls are made once, in order, by
/// [`negotiate`](super::negotiator::negotiate). After
/// [`apply_hw_params`](Self::apply_hw_params) the handle is moved to its
/// engine thread and only the I/O calls are used.
pub trait PcmDevice: Send {
    fn name(&self) -> &str;
    fn direction(&self) -> Direction;

    fn supports_interleaved(&mut self) -> bool;
    fn supports_format(&mut self, format: SampleFormat) -> bool;
    fn set_format(&mut self, format: SampleFormat) -> Result<(), PcmError>;
    /// Returns the rate the hardware will actually run at.
    fn set_rate_near(&mut self, rate: u32) -> Result<u32, PcmError>;
    fn set_channels_near(&mut self, channels: u16) -> Result<u16, PcmError>;
    fn set_periods_near(&mut self, periods: u32) -> Result<u32, PcmError>;
    fn set_buffer_size_near(&mut self, frames: usize) -> Result<usize, PcmError>;
    fn apply_hw_params(&mut self) -> Result<(), PcmError>;
    fn set_avail_min(&mut self, frames: usize) -> Result<(), PcmError>;

    /// Blocking read of up to `frames` interleaved frames into `buf`.
    fn read_interleaved(&mut self, buf: &mut [u8], frames: usize) -> Result<usize, PcmError>;
    /// Blocking write of up to `frames` interleaved frames from `buf`.
    fn write_interleaved(&mut self, buf: &[u8], frames: usize) -> Result<usize, PcmError>;

    fn state(&self) -> PcmState;
    /// Flush hardware state and re-arm after an xrun.
    fn drop_and_prepare(&mut self) -> Result<(), PcmError>;
}

/// Opens PCM handles by device index.
pub trait Backend: Send + Sync {
    fn label(&self) -> &str;
    /// `None` when the index has no device in that direction.
    fn open(&self, index: usize, direction: Direction) -> Option<Box<dyn PcmDevice>>;
    fn card_name(&self, index: usize) -> Option<String>;
}
