// src/audio/playback.rs
// Real-time playback loop: stream mixing, passthrough injection, output meters

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use super::capture::{PASSTHROUGH_FRAME_BYTES, PeriodOutcome};
use super::card::AudioCard;
use super::format::PcmFormat;
use super::lockfree_buffer::RingReader;
use super::negotiator::ScratchBuffers;
use super::pcm::{PcmDevice, PcmState};
use super::simd_mixer;

const I16_SCALE: f32 = 32768.0;
const I32_SCALE: f64 = 2_147_483_648.0;

pub struct PlaybackEngine {
    card: Arc<AudioCard>,
    pcm: Box<dyn PcmDevice>,
    format: PcmFormat,
    scratch: ScratchBuffers,
    /// One interleaved stereo `f32` bus per output port.
    bus: Vec<f32>,
    /// Decoded stereo chunk of the stream or passthrough being mixed.
    chunk: Vec<f32>,
    /// Raw 16-bit stream samples read from a play ring.
    stream_bytes: Vec<u8>,
    /// Consumer ends of each input port's passthrough ring.
    passthrough: Vec<RingReader>,
}

impl PlaybackEngine {
    pub fn new(
        card: Arc<AudioCard>,
        pcm: Box<dyn PcmDevice>,
        format: PcmFormat,
        passthrough: Vec<RingReader>,
    ) -> Self {
        let stride = format.period_frames * 2;
        Self {
            scratch: ScratchBuffers::for_format(&format),
            bus: vec![0.0; stride * card.outputs()],
            chunk: vec![0.0; stride],
            stream_bytes: vec![0; format.period_frames * 4],
            card,
            pcm,
            format,
            passthrough,
        }
    }

    pub fn run(mut self) {
        debug!(card = self.card.index, "playback thread started");
        while !self.card.is_exiting() {
            self.run_period();
        }
        debug!(card = self.card.index, "playback thread exiting");
    }

    /// Mix and write one hardware period.
    pub fn run_period(&mut self) -> PeriodOutcome {
        let frames = self.format.period_frames;
        let stride = frames * 2;

        simd_mixer::clear(&mut self.bus);
        self.mix_streams(stride);
        self.mix_passthrough(stride);
        simd_mixer::saturate(&mut self.bus);
        self.update_output_meters(stride);
        self.encode(stride);

        let bytes = self.format.period_bytes();
        match self
            .pcm
            .write_interleaved(&self.scratch.hardware[..bytes], frames)
        {
            Ok(written) if written != frames => {
                warn!(card = self.card.index, written, frames, "short playback write");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(card = self.card.index, %err, "playback write failed");
            }
        }

        if self.card.is_exiting() {
            return PeriodOutcome::Exiting;
        }
        if self.pcm.state() != PcmState::Running {
            self.card.playback_xruns.fetch_add(1, Ordering::Relaxed);
            debug!(card = self.card.index, "playback xrun, recovering");
            if let Err(err) = self.pcm.drop_and_prepare() {
                warn!(card = self.card.index, %err, "playback drop+prepare failed");
            }
            return PeriodOutcome::Recovered;
        }
        PeriodOutcome::Processed(frames)
    }

    fn mix_streams(&mut self, stride: usize) {
        let frames = self.format.period_frames;
        let outputs = self.card.outputs();

        for stream in self.card.streams.iter() {
            if !stream.is_playing() {
                continue;
            }
            let channels = stream.channels.load(Ordering::Acquire).clamp(1, 2) as usize;
            let frame_bytes = channels * 2;
            let wanted = frames * frame_bytes;

            let Some(produced) = stream.play_ring.try_with(|ring| {
                let read = ring.read_frames(&mut self.stream_bytes[..wanted], frame_bytes);
                let produced = read / frame_bytes;
                stream
                    .output_pos
                    .fetch_add(produced as u64, Ordering::AcqRel);
                produced
            }) else {
                continue;
            };

            if produced == 0 {
                stream.meters[0].add_value(0.0);
                stream.meters[1].add_value(0.0);
                if stream.eof.load(Ordering::Acquire) {
                    stream.stopping.store(true, Ordering::Release);
                }
                continue;
            }

            let samples = produced * 2;
            decode_i16(&self.stream_bytes, channels, produced, &mut self.chunk);
            let peaks = simd_mixer::peak_stereo(&self.chunk[..samples]);
            stream.meters[0].add_value(peaks[0]);
            stream.meters[1].add_value(peaks[1]);

            for port in 0..outputs {
                let gain = stream.gains[port].gain();
                if gain == 0.0 {
                    continue;
                }
                let bus = &mut self.bus[port * stride..port * stride + samples];
                simd_mixer::add_scaled(bus, &self.chunk[..samples], gain);
            }
        }
    }

    fn mix_passthrough(&mut self, stride: usize) {
        let frames = self.format.period_frames;
        let outputs = self.card.outputs();
        let wanted = frames * PASSTHROUGH_FRAME_BYTES;

        for input in 0..self.passthrough.len() {
            // Always drain so stale input never builds up behind a muted route.
            let read = self.passthrough[input]
                .read_frames(&mut self.scratch.staging[..wanted], PASSTHROUGH_FRAME_BYTES);
            let produced = read / PASSTHROUGH_FRAME_BYTES;
            if produced == 0 || !self.card.passthrough.input_active(input) {
                continue;
            }

            let samples = produced * 2;
            for (sample, bytes) in self.chunk[..samples]
                .iter_mut()
                .zip(self.scratch.staging[..read].chunks_exact(4))
            {
                let value = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                *sample = (value as f64 / I32_SCALE) as f32;
            }

            for output in 0..outputs {
                let Some(route) = self.card.passthrough.route(input, output) else {
                    continue;
                };
                let gain = route.gain();
                if gain == 0.0 {
                    continue;
                }
                let bus = &mut self.bus[output * stride..output * stride + samples];
                simd_mixer::add_scaled(bus, &self.chunk[..samples], gain);
            }
        }
    }

    fn update_output_meters(&self, stride: usize) {
        for (port, bus) in self.bus.chunks_exact(stride).enumerate() {
            let peaks = simd_mixer::peak_stereo(bus);
            let meters = &self.card.ports[port].output_meters;
            meters[0].add_value(peaks[0]);
            meters[1].add_value(peaks[1]);
        }
    }

    fn encode(&mut self, stride: usize) {
        let format = self.format;
        let sample_format = format.sample_format;
        let bps = format.bytes_per_sample();
        let bpf = format.bytes_per_frame();
        let hardware = &mut self.scratch.hardware[..format.period_bytes()];
        hardware.fill(0);

        for (port, bus) in self.bus.chunks_exact(stride).enumerate() {
            let offset = format.port_offset(port);
            for (frame, pair) in bus.chunks_exact(2).enumerate() {
                let at = frame * bpf + offset;
                sample_format.write_normalized(pair[0], &mut hardware[at..at + bps]);
                sample_format.write_normalized(pair[1], &mut hardware[at + bps..at + 2 * bps]);
            }
        }
    }
}

/// Decode 16-bit interleaved samples to a stereo chunk, duplicating mono.
fn decode_i16(bytes: &[u8], channels: usize, frames: usize, out: &mut [f32]) {
    for frame in 0..frames {
        let at = frame * channels * 2;
        let left = i16::from_le_bytes([bytes[at], bytes[at + 1]]) as f32 / I16_SCALE;
        let right = if channels == 1 {
            left
        } else {
            i16::from_le_bytes([bytes[at + 2], bytes[at + 3]]) as f32 / I16_SCALE
        };
        out[frame * 2] = left;
        out[frame * 2 + 1] = right;
    }
}
