//! Decoding of raw snapshot buffers into pixel values.

/// Unpack `Mono12Packed` data into 12-bit samples.
///
/// Every three bytes carry two pixels. The first pixel takes its high eight
/// bits from byte 0 and its low nibble from the low nibble of byte 1; the
/// second takes byte 2 and the high nibble of byte 1. A trailing partial
/// group is ignored.
#[must_use]
pub fn unpack_mono12_packed(bytes: &[u8]) -> Vec<u16> {
    let mut pixels = Vec::with_capacity(bytes.len() / 3 * 2);
    for group in bytes.chunks_exact(3) {
        if let [b0, b1, b2] = *group {
            pixels.push((u16::from(b0) << 4) | u16::from(b1 & 0x0F));
            pixels.push((u16::from(b2) << 4) | u16::from(b1 >> 4));
        }
    }
    pixels
}

/// Read little-endian 16-bit samples.
///
/// `Mono12` and `Mono16` both store one pixel per 16-bit word. A trailing odd
/// byte is ignored.
#[must_use]
pub fn unpack_mono16(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .filter_map(|pair| match *pair {
            [lo, hi] => Some(u16::from_le_bytes([lo, hi])),
            _ => None,
        })
        .collect()
}

/// Mean sample value, or `None` for an empty slice.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(pixels: &[u16]) -> Option<f64> {
    if pixels.is_empty() {
        return None;
    }
    let sum: u64 = pixels.iter().map(|&px| u64::from(px)).sum();
    Some(sum as f64 / pixels.len() as f64)
}
