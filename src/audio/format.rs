// src/audio/format.rs
// Sample encodings and interleaved frame geometry

use std::fmt;

/// Hardware sample encodings the engines handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    S16Le,
    S32Le,
}

const S16_SCALE: f32 = 32768.0;
const S32_SCALE: f64 = 2_147_483_648.0;

impl SampleFormat {
    /// Formats in order of preference.
    pub const PREFERENCE: [SampleFormat; 2] = [SampleFormat::S32Le, SampleFormat::S16Le];

    pub const fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S32Le => 4,
        }
    }

    /// Decode one sample to 16 bits; 32-bit samples keep their top half.
    #[inline]
    pub fn read_i16(self, bytes: &[u8]) -> i16 {
        match self {
            SampleFormat::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]),
            SampleFormat::S32Le => (read_s32(bytes) >> 16) as i16,
        }
    }

    /// Decode one sample at 32-bit scale; 16-bit samples are shifted up.
    #[inline]
    pub fn read_i32(self, bytes: &[u8]) -> i32 {
        match self {
            SampleFormat::S16Le => (i16::from_le_bytes([bytes[0], bytes[1]]) as i32) << 16,
            SampleFormat::S32Le => read_s32(bytes),
        }
    }

    /// Decode one sample to the normalized range.
    #[inline]
    pub fn read_normalized(self, bytes: &[u8]) -> f32 {
        match self {
            SampleFormat::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / S16_SCALE,
            SampleFormat::S32Le => (read_s32(bytes) as f64 / S32_SCALE) as f32,
        }
    }

    /// Encode a normalized sample, saturating at the encoding's range.
    #[inline]
    pub fn write_normalized(self, sample: f32, out: &mut [u8]) {
        match self {
            SampleFormat::S16Le => {
                let value = (sample * S16_SCALE)
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                out[..2].copy_from_slice(&value.to_le_bytes());
            }
            SampleFormat::S32Le => {
                let value = (sample as f64 * S32_SCALE)
                    .round()
                    .clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                out[..4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

#[inline]
fn read_s32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::S16Le => write!(f, "16 bit little-endian"),
            SampleFormat::S32Le => write!(f, "32 bit little-endian"),
        }
    }
}

/// Geometry negotiated for one direction of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub periods: u32,
    pub buffer_frames: usize,
    pub period_frames: usize,
}

impl PcmFormat {
    pub fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes_per_sample()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.bytes_per_sample()
    }

    pub fn period_bytes(&self) -> usize {
        self.period_frames * self.bytes_per_frame()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_frames * self.bytes_per_frame()
    }

    /// Number of whole stereo ports carried by the channel count.
    pub fn ports(&self) -> usize {
        self.channels as usize / 2
    }

    /// Byte offset of a port's left sample within a frame.
    pub fn port_offset(&self, port: usize) -> usize {
        port * 2 * self.bytes_per_sample()
    }

    /// Period duration in milliseconds, rounded up.
    pub fn period_ms(&self) -> u64 {
        (self.period_frames as u64 * 1000).div_ceil(self.sample_rate.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> PcmFormat {
        PcmFormat {
            sample_format: SampleFormat::S32Le,
            sample_rate: 48000,
            channels: 16,
            periods: 4,
            buffer_frames: 1024,
            period_frames: 256,
        }
    }

    #[test]
    fn test_geometry() {
        let format = scenario();
        assert_eq!(format.bytes_per_frame(), 64);
        assert_eq!(format.period_bytes(), 256 * 64);
        assert_eq!(format.buffer_bytes(), 1024 * 64);
        assert_eq!(format.ports(), 8);
        assert_eq!(format.port_offset(3), 24);
        assert_eq!(format.period_ms(), 6);
    }

    #[test]
    fn test_s32_truncates_to_16_bit() {
        let bytes = 0x1234_5678i32.to_le_bytes();
        assert_eq!(SampleFormat::S32Le.read_i16(&bytes), 0x1234);
        let negative = (-65536i32 - 1).to_le_bytes();
        assert_eq!(SampleFormat::S32Le.read_i16(&negative), -2);
    }

    #[test]
    fn test_s16_widens_to_32_bit() {
        let bytes = (-2i16).to_le_bytes();
        assert_eq!(SampleFormat::S16Le.read_i32(&bytes), -2 << 16);
    }

    #[test]
    fn test_write_saturates() {
        let mut out = [0u8; 4];
        SampleFormat::S16Le.write_normalized(1.5, &mut out);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), i16::MAX);
        SampleFormat::S16Le.write_normalized(-1.5, &mut out);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), i16::MIN);

        SampleFormat::S32Le.write_normalized(1.0, &mut out);
        assert_eq!(i32::from_le_bytes(out), i32::MAX);
        SampleFormat::S32Le.write_normalized(-1.0, &mut out);
        assert_eq!(i32::from_le_bytes(out), i32::MIN);
    }

    #[test]
    fn test_sixteen_bit_values_survive_normalization() {
        let mut out = [0u8; 4];
        for value in [-32768i16, -1, 0, 1, 8192, 32767] {
            let normalized = SampleFormat::S16Le.read_normalized(&value.to_le_bytes());
            SampleFormat::S32Le.write_normalized(normalized, &mut out);
            assert_eq!(i32::from_le_bytes(out), (value as i32) << 16);
        }
    }
}
