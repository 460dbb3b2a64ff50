// src/audio/session.rs
// Non-real-time halves of playback and recording: ring refill and drain

use super::error::MediaError;
use super::io::{PlaybackSource, RecordSink, StreamResampler};
use super::lockfree_buffer::{RingReader, RingWriter};

const READ_BLOCK_FRAMES: usize = 4096;

/// Feeds one stream's play ring from its source, resampling to the device
/// rate when needed.
pub struct PlaybackSession {
    source: Box<dyn PlaybackSource>,
    writer: RingWriter,
    channels: usize,
    device_rate: u32,
    resampler: Option<StreamResampler>,
    block: Vec<i16>,
    /// Converted samples not yet accepted by the ring.
    pending: Vec<i16>,
    pending_at: usize,
    bytes: Vec<u8>,
    exhausted: bool,
    /// Source frame the current play position counts from.
    offset_frames: u64,
}

impl PlaybackSession {
    pub fn new(
        source: Box<dyn PlaybackSource>,
        writer: RingWriter,
        device_rate: u32,
    ) -> Result<Self, MediaError> {
        let channels = source.channels() as usize;
        let resampler = if source.sample_rate() != device_rate {
            Some(StreamResampler::new(
                source.sample_rate(),
                device_rate,
                channels,
            )?)
        } else {
            None
        };
        Ok(Self {
            block: vec![0; READ_BLOCK_FRAMES * channels],
            pending: Vec::with_capacity(READ_BLOCK_FRAMES * channels * 2),
            pending_at: 0,
            bytes: Vec::with_capacity(READ_BLOCK_FRAMES * channels * 4),
            source,
            writer,
            channels,
            device_rate,
            resampler,
            exhausted: false,
            offset_frames: 0,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn source_rate(&self) -> u32 {
        self.source.sample_rate()
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    pub fn length_ms(&self) -> u64 {
        self.source.length_frames() * 1000 / self.source_rate().max(1) as u64
    }

    pub fn offset_ms(&self) -> u64 {
        self.offset_frames * 1000 / self.source_rate().max(1) as u64
    }

    /// Top up the ring. Returns `true` once the source is exhausted and every
    /// converted sample has been handed to the ring.
    pub fn fill(&mut self) -> Result<bool, MediaError> {
        loop {
            if !self.flush_pending() {
                return Ok(false);
            }
            if self.exhausted {
                return Ok(true);
            }

            let read = self.source.read(&mut self.block)?;
            let read = read - read % self.channels;
            self.pending.clear();
            self.pending_at = 0;

            match (&mut self.resampler, read) {
                (Some(resampler), 0) => {
                    resampler.flush(&mut self.pending)?;
                    self.exhausted = true;
                }
                (Some(resampler), n) => resampler.push(&self.block[..n], &mut self.pending)?,
                (None, 0) => self.exhausted = true,
                (None, n) => self.pending.extend_from_slice(&self.block[..n]),
            }
        }
    }

    /// Write pending samples; `false` if the ring filled up first.
    fn flush_pending(&mut self) -> bool {
        let frame_samples = self.channels;
        let remaining = &self.pending[self.pending_at..];
        if remaining.is_empty() {
            return true;
        }

        let writable_frames = self.writer.writable_bytes() / (frame_samples * 2);
        let frames = (remaining.len() / frame_samples).min(writable_frames);
        if frames == 0 {
            return false;
        }
        let samples = frames * frame_samples;

        self.bytes.clear();
        for sample in &remaining[..samples] {
            self.bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let written = self.writer.write(&self.bytes);
        self.pending_at += written / 2;
        self.pending_at == self.pending.len()
    }

    /// Restart from `position_ms`. The caller must empty the play ring.
    pub fn seek(&mut self, position_ms: u64) -> Result<(), MediaError> {
        let frame = position_ms * self.source_rate() as u64 / 1000;
        self.source.seek(frame)?;
        self.offset_frames = frame;
        self.pending.clear();
        self.pending_at = 0;
        self.exhausted = false;
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
        Ok(())
    }
}

/// Drains one port's record ring into its sink.
pub struct RecordSession {
    sink: Box<dyn RecordSink>,
    reader: RingReader,
    channels: usize,
    frames: u64,
    bytes: Vec<u8>,
    samples: Vec<i16>,
}

impl RecordSession {
    pub fn new(sink: Box<dyn RecordSink>, reader: RingReader, channels: usize) -> Self {
        let capacity = reader.capacity();
        Self {
            sink,
            reader,
            channels,
            frames: 0,
            bytes: vec![0; capacity],
            samples: Vec::with_capacity(capacity / 2),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Move everything readable to the sink, returning the frames moved.
    pub fn drain(&mut self) -> Result<u64, MediaError> {
        let frame_bytes = self.channels * 2;
        let mut moved = 0u64;
        loop {
            let read = self.reader.read_frames(&mut self.bytes, frame_bytes);
            if read == 0 {
                return Ok(moved);
            }
            self.samples.clear();
            self.samples.extend(
                self.bytes[..read]
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]])),
            );
            self.sink.write(&self.samples)?;
            let frames = (read / frame_bytes) as u64;
            self.frames += frames;
            moved += frames;
        }
    }

    /// Drain the remainder and close the sink. Returns total frames recorded.
    pub fn finish(mut self) -> Result<u64, MediaError> {
        self.drain()?;
        self.sink.finalize()?;
        Ok(self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::lockfree_buffer::ring_buffer;
    use std::sync::Arc;
    use parking_lot::Mutex;

    struct VecSource {
        samples: Vec<i16>,
        at: usize,
        channels: u16,
        rate: u32,
    }

    impl PlaybackSource for VecSource {
        fn channels(&self) -> u16 {
            self.channels
        }
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn length_frames(&self) -> u64 {
            (self.samples.len() / self.channels as usize) as u64
        }
        fn read(&mut self, out: &mut [i16]) -> Result<usize, MediaError> {
            let n = out.len().min(self.samples.len() - self.at);
            out[..n].copy_from_slice(&self.samples[self.at..self.at + n]);
            self.at += n;
            Ok(n)
        }
        fn seek(&mut self, frame: u64) -> Result<(), MediaError> {
            self.at = frame as usize * self.channels as usize;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct VecSink(Arc<Mutex<(Vec<i16>, bool)>>);

    impl RecordSink for VecSink {
        fn write(&mut self, samples: &[i16]) -> Result<(), MediaError> {
            self.0.lock().0.extend_from_slice(samples);
            Ok(())
        }
        fn finalize(self: Box<Self>) -> Result<(), MediaError> {
            self.0.lock().1 = true;
            Ok(())
        }
    }

    fn source(samples: Vec<i16>, channels: u16, rate: u32) -> Box<dyn PlaybackSource> {
        Box::new(VecSource {
            samples,
            at: 0,
            channels,
            rate,
        })
    }

    fn drain_i16(reader: &mut RingReader) -> Vec<i16> {
        let mut bytes = vec![0u8; reader.readable_bytes()];
        reader.read(&mut bytes);
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_fill_respects_ring_capacity() {
        let samples: Vec<i16> = (0..100).collect();
        let (writer, mut reader) = ring_buffer(64);
        let mut session = PlaybackSession::new(source(samples, 2, 48000), writer, 48000).unwrap();

        assert!(!session.fill().unwrap());
        let first = drain_i16(&mut reader);
        assert_eq!(first, (0..32).collect::<Vec<i16>>());

        let mut all = first;
        loop {
            let done = session.fill().unwrap();
            all.extend(drain_i16(&mut reader));
            if done {
                break;
            }
        }
        assert_eq!(all, (0..100).collect::<Vec<i16>>());
    }

    #[test]
    fn test_seek_restarts_and_tracks_offset() {
        let samples: Vec<i16> = (0..480).collect();
        let (writer, mut reader) = ring_buffer(4096);
        let mut session = PlaybackSession::new(source(samples, 1, 48000), writer, 48000).unwrap();
        assert!(session.fill().unwrap());
        assert_eq!(session.length_ms(), 10);

        reader.reset();
        session.seek(5).unwrap();
        assert_eq!(session.offset_ms(), 5);
        assert!(session.fill().unwrap());
        let rest = drain_i16(&mut reader);
        assert_eq!(rest.first(), Some(&240));
        assert_eq!(rest.len(), 240);
    }

    #[test]
    fn test_resampled_session_reaches_eof() {
        let samples = vec![1000i16; 2400];
        let (writer, mut reader) = ring_buffer(1 << 16);
        let mut session = PlaybackSession::new(source(samples, 1, 24000), writer, 48000).unwrap();
        assert!(session.is_resampling());
        assert!(session.fill().unwrap());
        assert_eq!(drain_i16(&mut reader).len(), 4800);
    }

    #[test]
    fn test_record_session_counts_frames() {
        let sink = VecSink::default();
        let (mut writer, reader) = ring_buffer(256);
        let mut session = RecordSession::new(Box::new(sink.clone()), reader, 2);

        for sample in [1i16, 2, 3, 4, 5, 6] {
            writer.write(&sample.to_le_bytes());
        }
        assert_eq!(session.drain().unwrap(), 3);
        writer.write(&7i16.to_le_bytes());
        writer.write(&8i16.to_le_bytes());

        assert_eq!(session.finish().unwrap(), 4);
        let recorded = sink.0.lock();
        assert_eq!(recorded.0, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(recorded.1);
    }
}
