// src/audio/capture.rs
// Real-time capture loop: demux, input gain, record and passthrough feeds, meters

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use super::card::AudioCard;
use super::format::PcmFormat;
use super::lockfree_buffer::RingWriter;
use super::negotiator::ScratchBuffers;
use super::pcm::{PcmDevice, PcmState};

/// Bytes per passthrough frame: stereo `i32` little-endian.
pub const PASSTHROUGH_FRAME_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodOutcome {
    Processed(usize),
    Recovered,
    Exiting,
}

pub struct CaptureEngine {
    card: Arc<AudioCard>,
    pcm: Box<dyn PcmDevice>,
    format: PcmFormat,
    scratch: ScratchBuffers,
    record: Vec<u8>,
    /// Producer ends of each input port's passthrough ring.
    passthrough: Vec<RingWriter>,
}

impl CaptureEngine {
    pub fn new(
        card: Arc<AudioCard>,
        pcm: Box<dyn PcmDevice>,
        format: PcmFormat,
        passthrough: Vec<RingWriter>,
    ) -> Self {
        Self {
            scratch: ScratchBuffers::for_format(&format),
            record: vec![0; format.period_frames * 4],
            card,
            pcm,
            format,
            passthrough,
        }
    }

    /// Loop until the card is torn down.
    pub fn run(mut self) {
        debug!(card = self.card.index, "capture thread started");
        while !self.card.is_exiting() {
            self.run_period();
        }
        debug!(card = self.card.index, "capture thread exiting");
    }

    /// Read and process one hardware period.
    pub fn run_period(&mut self) -> PeriodOutcome {
        let frames = self.format.period_frames;
        let bytes = self.format.period_bytes();
        let result = self
            .pcm
            .read_interleaved(&mut self.scratch.hardware[..bytes], frames);
        let exiting = self.card.is_exiting();
        let running = self.pcm.state() == PcmState::Running;

        match result {
            Ok(read) if running || exiting => {
                self.process(read.min(frames));
                PeriodOutcome::Processed(read)
            }
            _ if exiting => PeriodOutcome::Exiting,
            Ok(_) => {
                self.recover("device not running");
                PeriodOutcome::Recovered
            }
            Err(err) => {
                self.recover(&err.to_string());
                PeriodOutcome::Recovered
            }
        }
    }

    fn recover(&mut self, reason: &str) {
        self.card.capture_xruns.fetch_add(1, Ordering::Relaxed);
        debug!(card = self.card.index, reason, "capture xrun, recovering");
        if let Err(err) = self.pcm.drop_and_prepare() {
            warn!(card = self.card.index, %err, "capture drop+prepare failed");
        }
    }

    fn process(&mut self, frames: usize) {
        let format = self.format;
        let sample_format = format.sample_format;
        let bps = format.bytes_per_sample();
        let bpf = format.bytes_per_frame();
        let hardware = &self.scratch.hardware;

        for index in 0..self.card.inputs() {
            let port = &self.card.ports[index];
            let gain = port.input_gain.gain();
            let mut record = port.is_recording() && gain != 0.0;
            let mono = port.record_channels.load(Ordering::Relaxed) == 1;
            let offset = format.port_offset(index);

            let mut peaks = [0f32; 2];
            let mut record_len = 0;
            for frame in 0..frames {
                let left = &hardware[frame * bpf + offset..];
                let right = &left[bps..];

                peaks[0] = peaks[0].max(sample_format.read_normalized(left).abs());
                peaks[1] = peaks[1].max(sample_format.read_normalized(right).abs());

                let staged = &mut self.scratch.staging[frame * PASSTHROUGH_FRAME_BYTES..];
                staged[..4].copy_from_slice(&sample_format.read_i32(left).to_le_bytes());
                staged[4..8].copy_from_slice(&sample_format.read_i32(right).to_le_bytes());

                if record {
                    let l = (sample_format.read_i16(left) as f32 * gain) as i16;
                    let r = (sample_format.read_i16(right) as f32 * gain) as i16;
                    if mono {
                        let sum = l.saturating_add(r);
                        self.record[record_len..record_len + 2].copy_from_slice(&sum.to_le_bytes());
                        record_len += 2;
                    } else {
                        self.record[record_len..record_len + 2].copy_from_slice(&l.to_le_bytes());
                        self.record[record_len + 2..record_len + 4]
                            .copy_from_slice(&r.to_le_bytes());
                        record_len += 4;
                    }
                }
            }

            port.input_meters[0].add_value(peaks[0]);
            port.input_meters[1].add_value(peaks[1]);

            if let Some(ring) = self.passthrough.get_mut(index) {
                let len = frames * PASSTHROUGH_FRAME_BYTES;
                if ring.write_frames(&self.scratch.staging[..len], PASSTHROUGH_FRAME_BYTES) < len {
                    port.passthrough_overruns.fetch_add(1, Ordering::Relaxed);
                }
            }

            if record && !port.vox_triggered.load(Ordering::Acquire) {
                let threshold = port.vox_threshold.gain();
                if peaks[0].max(peaks[1]) >= threshold {
                    port.vox_triggered.store(true, Ordering::Release);
                } else {
                    record = false;
                }
            }

            if record {
                let frame_bytes = if mono { 2 } else { 4 };
                let written = port
                    .record_ring
                    .try_with(|ring| ring.write_frames(&self.record[..record_len], frame_bytes));
                if written != Some(record_len) {
                    port.record_overruns.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
