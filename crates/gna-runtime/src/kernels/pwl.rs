//! Piecewise-linear activation
//!
//! A segment covers inputs from its base upward. The two low bits of
//! `x_base` select the slope scale: the product is shifted right by
//! `((x_base & 3) + 1) · 8` bits.

use bytemuck::{Pod, Zeroable};

/// One activation segment as stored in device memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PwlSegment {
    /// Segment start; the low two bits encode the slope scale
    pub x_base: i32,
    /// Output at the segment start
    pub y_base: i16,
    /// Slope numerator
    pub slope: i16,
}

impl PwlSegment {
    /// Encoded size of one segment.
    pub const SIZE: usize = 8;

    /// Segment starting at `x_base` (low bits cleared) with `scale` in 0..=3.
    #[must_use]
    pub const fn new(x_base: i32, y_base: i16, slope: i16, scale: u8) -> Self {
        Self {
            x_base: (x_base & !3) | (scale & 3) as i32,
            y_base,
            slope,
        }
    }

    /// Segment start without the scale bits.
    #[must_use]
    pub const fn base(self) -> i64 {
        (self.x_base & !3) as i64
    }

    /// Right shift applied to the slope product.
    #[must_use]
    pub const fn shift(self) -> u32 {
        ((self.x_base & 3) as u32 + 1) * 8
    }

    /// Output of this segment for `x`.
    #[must_use]
    pub const fn evaluate(self, x: i64) -> i64 {
        self.y_base as i64 + (((x - self.base()) * self.slope as i64) >> self.shift())
    }
}

/// Decode segments from device bytes.
#[must_use]
pub fn decode_segments(bytes: &[u8]) -> Vec<PwlSegment> {
    bytes
        .chunks_exact(PwlSegment::SIZE)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Encode segments for device memory.
#[must_use]
pub fn encode_segments(segments: &[PwlSegment]) -> Vec<u8> {
    bytemuck::cast_slice(segments).to_vec()
}

/// Apply the activation. Inputs below the first segment evaluate to its
/// base output.
#[must_use]
pub fn activate(segments: &[PwlSegment], x: i64) -> i64 {
    let Some(first) = segments.first() else {
        return x;
    };
    if x < first.base() {
        return i64::from(first.y_base);
    }
    let index = segments.partition_point(|segment| segment.base() <= x);
    segments[index.saturating_sub(1)].evaluate(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu() -> Vec<PwlSegment> {
        vec![
            PwlSegment::new(i32::MIN, 0, 0, 0),
            PwlSegment::new(0, 0, 256, 0),
        ]
    }

    #[test]
    fn relu_like_activation() {
        let segments = relu();
        assert_eq!(activate(&segments, -500), 0);
        assert_eq!(activate(&segments, 0), 0);
        assert_eq!(activate(&segments, 1234), 1234);
    }

    #[test]
    fn scale_bits_pick_the_shift() {
        let segment = PwlSegment::new(0, 10, 1, 1);
        assert_eq!(segment.shift(), 16);
        assert_eq!(segment.evaluate(1 << 17), 12);
    }

    #[test]
    fn bytes_round_trip() {
        let segments = relu();
        let bytes = encode_segments(&segments);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_segments(&bytes), segments);
    }
}
