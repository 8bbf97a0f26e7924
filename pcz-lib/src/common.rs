pub const ZSTD_MAX_COMPRESSION_LVL: u32 = 22;

/// Largest quantized coordinate value; the widest bounding-box axis is
/// scaled to span exactly [0, Q_MAX].
pub const Q_MAX: i16 = i16::MAX;

pub const DEFAULT_COLOR: [u8; 3] = [255, 255, 255];

/// Rounding is round-half-away-from-zero (`f64::round`). Out-of-range
/// results are clamped to the i16 bounds, never wrapped.
#[inline]
pub(crate) fn quantize_coord(coord: f64, min: f64, scale: f64) -> i16 {
    ((coord - min) * scale)
        .round()
        .clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

#[inline]
pub(crate) fn dequantize_coord(q: i16, min: f64, scale: f64) -> f64 {
    q as f64 / scale + min
}

/// Per-axis (min, max) over a flat xyz array. Empty input yields the
/// identity-friendly ([0; 3], [0; 3]).
pub(crate) fn bounding_box(positions: &[f64]) -> ([f64; 3], [f64; 3]) {
    if positions.is_empty() {
        return ([0.0; 3], [0.0; 3]);
    }
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for point in positions.chunks_exact(3) {
        for axis in 0..3 {
            min[axis] = min[axis].min(point[axis]);
            max[axis] = max[axis].max(point[axis]);
        }
    }
    (min, max)
}
