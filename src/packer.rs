// Pixel packing module
// Converts straight-alpha RGBA8 into premultiplied wl_shm ARGB8888 words

use crate::error::OverlayError;
use crate::geometry::BYTES_PER_PIXEL;

/// Compose one premultiplied ARGB8888 word from an RGBA pixel.
///
/// Alpha lands in the most significant byte and blue in the least. The
/// value is built arithmetically, so it does not depend on host byte order.
#[inline]
pub fn argb8888([r, g, b, a]: [u8; 4]) -> u32 {
    (a as u32) << 24
        | (premultiply(r, a) as u32) << 16
        | (premultiply(g, a) as u32) << 8
        | premultiply(b, a) as u32
}

/// `round(c * a / 255)` in integer arithmetic
#[inline]
fn premultiply(c: u8, a: u8) -> u8 {
    let t = c as u32 * a as u32 + 128;
    ((t + (t >> 8)) >> 8) as u8
}

/// Pack `src` (RGBA8) into `dst` as ARGB8888 words.
///
/// `wl_shm` formats are defined little-endian, so each word is stored
/// with `to_le_bytes` whatever the host is.
pub fn pack(src: &[u8], dst: &mut [u8]) -> Result<(), OverlayError> {
    if src.len() != dst.len() || src.len() % BYTES_PER_PIXEL != 0 {
        return Err(OverlayError::Allocation(format!(
            "cannot pack {} source bytes into a {} byte buffer",
            src.len(),
            dst.len()
        )));
    }

    for (from, to) in src
        .chunks_exact(BYTES_PER_PIXEL)
        .zip(dst.chunks_exact_mut(BYTES_PER_PIXEL))
    {
        let word = argb8888([from[0], from[1], from[2], from[3]]);
        to.copy_from_slice(&word.to_le_bytes());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_pixel_word() {
        assert_eq!(argb8888([10, 20, 30, 255]), 0xFF0A141E);
        assert_eq!(argb8888([255, 255, 255, 255]), 0xFFFFFFFF);
    }

    #[test]
    fn transparent_pixel_is_zero() {
        assert_eq!(argb8888([200, 100, 50, 0]), 0);
    }

    #[test]
    fn translucent_pixel_is_premultiplied() {
        // 200 * 128 / 255 = 100.4, 100 * 128 / 255 = 50.2
        assert_eq!(argb8888([200, 100, 0, 128]), 0x80_64_32_00);
    }

    #[test]
    fn premultiply_matches_float_rounding() {
        for a in 0..=255u8 {
            for c in 0..=255u8 {
                let expected = (c as f64 * a as f64 / 255.0).round() as u8;
                assert_eq!(premultiply(c, a), expected, "c={c} a={a}");
            }
        }
    }

    #[test]
    fn packed_bytes_are_little_endian() {
        let src = [10, 20, 30, 255, 0, 0, 0, 0];
        let mut dst = [0xEEu8; 8];
        pack(&src, &mut dst).unwrap();
        assert_eq!(dst, [0x1E, 0x14, 0x0A, 0xFF, 0, 0, 0, 0]);
        assert_eq!(u32::from_le_bytes([dst[0], dst[1], dst[2], dst[3]]), 0xFF0A141E);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut dst = [0u8; 4];
        assert!(pack(&[0u8; 8], &mut dst).is_err());
        let mut dst = [0u8; 3];
        assert!(pack(&[0u8; 3], &mut dst).is_err());
    }
}
