// src/audio/card.rs
// Per-card state shared between the facade and the real-time engines

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use super::config::DriverConfig;
use super::format::PcmFormat;
use super::level::GainCell;
use super::lockfree_buffer::{RingReader, RingSlot, RingWriter};
use super::peak_meter::{StereoMeter, stereo_meter};

/// One stereo pair, used as an input on the capture side and as an output on
/// the playback side.
pub struct Port {
    pub(crate) recording: AtomicBool,
    pub(crate) ready: AtomicBool,
    pub(crate) input_gain: GainCell,
    /// Capture starts writing once a period peak reaches this level.
    pub(crate) vox_threshold: GainCell,
    pub(crate) vox_triggered: AtomicBool,
    pub(crate) record_channels: AtomicU8,
    pub(crate) input_meters: StereoMeter,
    pub(crate) output_meters: StereoMeter,
    pub(crate) record_ring: RingSlot<RingWriter>,
    pub(crate) record_overruns: AtomicU64,
    pub(crate) passthrough_overruns: AtomicU64,
}

impl Port {
    fn new(input_window: usize, output_window: usize) -> Self {
        Self {
            recording: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            input_gain: GainCell::unity(),
            vox_threshold: GainCell::muted(),
            vox_triggered: AtomicBool::new(true),
            record_channels: AtomicU8::new(2),
            input_meters: stereo_meter(input_window),
            output_meters: stereo_meter(output_window),
            record_ring: RingSlot::empty(),
            record_overruns: AtomicU64::new(0),
            passthrough_overruns: AtomicU64::new(0),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Armed by `load_record` with a record ring installed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// One playback voice.
pub struct Stream {
    pub(crate) playing: AtomicBool,
    pub(crate) stopping: AtomicBool,
    pub(crate) eof: AtomicBool,
    /// Frames delivered to hardware since load or the last seek.
    pub(crate) output_pos: AtomicU64,
    pub(crate) channels: AtomicU8,
    /// Gain towards each output port.
    pub(crate) gains: Box<[GainCell]>,
    pub(crate) meters: StereoMeter,
    pub(crate) play_ring: RingSlot<RingReader>,
}

impl Stream {
    fn new(ports: usize, window: usize) -> Self {
        Self {
            playing: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            output_pos: AtomicU64::new(0),
            channels: AtomicU8::new(2),
            gains: (0..ports).map(|_| GainCell::unity()).collect(),
            meters: stereo_meter(window),
            play_ring: RingSlot::empty(),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Clear flags and counters ahead of a new load.
    pub(crate) fn reset(&self, channels: u8) {
        self.playing.store(false, Ordering::Release);
        self.stopping.store(false, Ordering::Release);
        self.eof.store(false, Ordering::Release);
        self.output_pos.store(0, Ordering::Release);
        self.channels.store(channels, Ordering::Release);
        for meter in &self.meters {
            meter.reset();
        }
    }
}

/// Input-to-output bypass gains, muted by default.
pub struct PassthroughMatrix {
    outputs: usize,
    gains: Box<[GainCell]>,
}

impl PassthroughMatrix {
    fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            outputs,
            gains: (0..inputs * outputs).map(|_| GainCell::muted()).collect(),
        }
    }

    pub fn route(&self, input: usize, output: usize) -> Option<&GainCell> {
        if output >= self.outputs {
            return None;
        }
        self.gains.get(input * self.outputs + output)
    }

    /// Whether any route leaving `input` is audible.
    pub fn input_active(&self, input: usize) -> bool {
        let start = input * self.outputs;
        self.gains
            .get(start..start + self.outputs)
            .is_some_and(|routes| routes.iter().any(|g| !g.is_muted()))
    }
}

/// One hardware device with its ports, streams and routing.
pub struct AudioCard {
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) capture: Option<PcmFormat>,
    pub(crate) playback: Option<PcmFormat>,
    pub(crate) ports: Box<[Port]>,
    pub(crate) streams: Box<[Stream]>,
    pub(crate) passthrough: PassthroughMatrix,
    pub(crate) exiting: AtomicBool,
    pub(crate) capture_xruns: AtomicU64,
    pub(crate) playback_xruns: AtomicU64,
}

impl AudioCard {
    pub fn new(
        index: usize,
        name: String,
        capture: Option<PcmFormat>,
        playback: Option<PcmFormat>,
        config: &DriverConfig,
    ) -> Self {
        let window = |format: Option<PcmFormat>| {
            format
                .map(|f| config.meter_window_periods(f.sample_rate, f.period_frames))
                .unwrap_or(1)
        };
        let input_window = window(capture);
        let output_window = window(playback);
        let max_ports = config.max_ports;

        let inputs = capture.map_or(0, |f| f.ports().min(max_ports));
        let outputs = playback.map_or(0, |f| f.ports().min(max_ports));

        Self {
            index,
            name,
            capture,
            playback,
            ports: (0..max_ports)
                .map(|_| Port::new(input_window, output_window))
                .collect(),
            streams: (0..config.max_streams)
                .map(|_| Stream::new(max_ports, output_window))
                .collect(),
            passthrough: PassthroughMatrix::new(inputs, outputs),
            exiting: AtomicBool::new(false),
            capture_xruns: AtomicU64::new(0),
            playback_xruns: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of usable input ports.
    pub fn inputs(&self) -> usize {
        self.capture
            .map_or(0, |f| f.ports().min(self.ports.len()))
    }

    /// Number of usable output ports.
    pub fn outputs(&self) -> usize {
        self.playback
            .map_or(0, |f| f.ports().min(self.ports.len()))
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;

    fn format(channels: u16) -> PcmFormat {
        PcmFormat {
            sample_format: SampleFormat::S16Le,
            sample_rate: 48000,
            channels,
            periods: 4,
            buffer_frames: 1024,
            period_frames: 256,
        }
    }

    #[test]
    fn test_port_counts_follow_formats() {
        let config = DriverConfig::default();
        let card = AudioCard::new(0, "test".into(), Some(format(4)), Some(format(32)), &config);
        assert_eq!(card.inputs(), 2);
        assert_eq!(card.outputs(), 8);
        assert_eq!(card.streams.len(), 32);
        assert_eq!(card.ports[0].input_meters[0].window(), 61);
    }

    #[test]
    fn test_passthrough_defaults_muted() {
        let config = DriverConfig::default();
        let card = AudioCard::new(0, "test".into(), Some(format(4)), Some(format(4)), &config);
        assert!(!card.passthrough.input_active(0));
        card.passthrough.route(0, 1).unwrap().set_level(-600);
        assert!(card.passthrough.input_active(0));
        assert!(!card.passthrough.input_active(1));
        assert!(card.passthrough.route(0, 2).is_none());
        assert!(card.passthrough.route(2, 0).is_none());
    }

    #[test]
    fn test_stream_gains_default_unity() {
        let config = DriverConfig::default();
        let card = AudioCard::new(0, "test".into(), None, Some(format(16)), &config);
        assert!(card.streams[0].gains.iter().all(|g| g.level() == 0));
        assert_eq!(card.inputs(), 0);
    }
}
