// src/audio/lockfree_buffer.rs
// Byte-oriented SPSC ring between the real-time engines and the bookkeeping task

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};

/// Create a ring of `capacity` bytes split into its two ends.
pub fn ring_buffer(capacity: usize) -> (RingWriter, RingReader) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        RingWriter { producer, capacity },
        RingReader { consumer, capacity },
    )
}

/// Producer end. Never blocks; short writes mean the ring is full.
pub struct RingWriter {
    producer: Producer<u8>,
    capacity: usize,
}

impl RingWriter {
    /// Write as many bytes as fit, returning the count written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.producer.slots());
        if n == 0 {
            return 0;
        }
        match self.producer.write_chunk_uninit(n) {
            Ok(chunk) => chunk.fill_from_iter(bytes[..n].iter().copied()),
            Err(_) => 0,
        }
    }

    /// Write as many whole frames of `bytes` as fit; a frame is never split.
    pub fn write_frames(&mut self, bytes: &[u8], frame_bytes: usize) -> usize {
        let room = self.producer.slots().min(bytes.len());
        let whole = room - room % frame_bytes.max(1);
        self.write(&bytes[..whole])
    }

    pub fn writable_bytes(&self) -> usize {
        self.producer.slots()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Consumer end. Never blocks; short reads mean the ring is empty.
pub struct RingReader {
    consumer: Consumer<u8>,
    capacity: usize,
}

impl RingReader {
    /// Read up to `out.len()` bytes, returning the count read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.consumer.slots());
        if n == 0 {
            return 0;
        }
        match self.consumer.read_chunk(n) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..n].copy_from_slice(second);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    /// Read only whole frames of `frame_bytes` each.
    pub fn read_frames(&mut self, out: &mut [u8], frame_bytes: usize) -> usize {
        let available = self.consumer.slots().min(out.len());
        let whole = available - available % frame_bytes.max(1);
        self.read(&mut out[..whole])
    }

    /// Discard everything currently readable.
    pub fn reset(&mut self) -> usize {
        let n = self.consumer.slots();
        if let Ok(chunk) = self.consumer.read_chunk(n) {
            chunk.commit_all();
        }
        n
    }

    pub fn readable_bytes(&self) -> usize {
        self.consumer.slots()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Hand-off point for a ring end shared by the facade and one audio thread.
///
/// The audio thread only ever calls [`try_with`](Self::try_with) and skips the
/// ring for that period if the facade holds the lock.
pub struct RingSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> RingSlot<T> {
    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install a ring end, returning any previous one.
    pub fn install(&self, ring: T) -> Option<T> {
        self.inner.lock().replace(ring)
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Non-blocking access for the audio thread.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.try_lock()?;
        guard.as_mut().map(f)
    }

    /// Blocking access for the control side.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }
}

impl<T> Default for RingSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}
