pub mod backend;
pub mod capture;
pub mod card;
pub mod config;
pub mod driver;
pub mod error;
pub mod fade;
pub mod format;
pub mod io;
pub mod level;
pub mod lockfree_buffer;
pub mod negotiator;
pub mod pcm;
pub mod peak_meter;
pub mod playback;
pub mod session;
pub mod simd_mixer;
pub mod timer;

pub use config::{BackendKind, DriverConfig, EngineMode};
pub use driver::{CardInfo, Driver, DriverBuilder, NORMAL_SPEED};
pub use error::{DriverError, DriverResult, MediaError, NegotiationError, PcmError};
pub use io::{Coding, EncoderFactory, MediaOpener, PlaybackSource, RecordRequest, RecordSink};
pub use level::{MUTE_LEVEL, UNITY_LEVEL, level_to_gain, meter_level};
pub use pcm::{Backend, Direction, PcmDevice, PcmState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Playing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Recording,
    Stopped,
}

/// State changes published to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    Play {
        card: usize,
        stream: usize,
        state: PlayState,
    },
    Record {
        card: usize,
        port: usize,
        state: RecordState,
    },
}
