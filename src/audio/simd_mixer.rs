// src/audio/simd_mixer.rs
// SIMD kernels for the per-port stereo mix bus

use wide::f32x4;

#[inline]
fn load(chunk: &[f32]) -> f32x4 {
    f32x4::new([chunk[0], chunk[1], chunk[2], chunk[3]])
}

/// Zero a bus.
#[inline]
pub fn clear(buffer: &mut [f32]) {
    let zero = f32x4::splat(0.0).to_array();
    let mut chunks = buffer.chunks_exact_mut(4);
    for chunk in &mut chunks {
        chunk.copy_from_slice(&zero);
    }
    for sample in chunks.into_remainder() {
        *sample = 0.0;
    }
}

/// `dest += src * gain` over the common length.
#[inline]
pub fn add_scaled(dest: &mut [f32], src: &[f32], gain: f32) {
    let len = dest.len().min(src.len());
    let gain_vec = f32x4::splat(gain);
    let chunks = len / 4;

    for i in 0..chunks {
        let idx = i * 4;
        let result = load(&dest[idx..]) + load(&src[idx..]) * gain_vec;
        dest[idx..idx + 4].copy_from_slice(&result.to_array());
    }

    for i in chunks * 4..len {
        dest[i] += src[i] * gain;
    }
}

/// Hard-limit every sample to the normalized range `[-1.0, 1.0]`.
#[inline]
pub fn saturate(buffer: &mut [f32]) {
    let one = f32x4::splat(1.0);
    let neg_one = f32x4::splat(-1.0);
    let mut chunks = buffer.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let limited = load(chunk).max(neg_one).min(one);
        chunk.copy_from_slice(&limited.to_array());
    }
    for sample in chunks.into_remainder() {
        *sample = sample.clamp(-1.0, 1.0);
    }
}

/// Per-channel absolute peak of an interleaved stereo buffer.
#[inline]
pub fn peak_stereo(interleaved: &[f32]) -> [f32; 2] {
    // Lanes hold L R L R, so lanes 0/2 and 1/3 reduce to left and right.
    let mut acc = f32x4::splat(0.0);
    let mut chunks = interleaved.chunks_exact(4);
    for chunk in &mut chunks {
        acc = acc.max(load(chunk).abs());
    }
    let lanes = acc.to_array();
    let mut peaks = [lanes[0].max(lanes[2]), lanes[1].max(lanes[3])];
    for (i, sample) in chunks.remainder().iter().enumerate() {
        peaks[i % 2] = peaks[i % 2].max(sample.abs());
    }
    peaks
}
