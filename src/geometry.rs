// Geometry module
// Resolves the overlay size from the requested and intrinsic dimensions

use crate::error::OverlayError;

/// Bytes per pixel of both the RGBA8 source and the ARGB8888 buffer
pub const BYTES_PER_PIXEL: usize = 4;

/// Largest frame a wl_shm pool can describe (sizes travel as `i32`)
pub const MAX_FRAME_BYTES: usize = i32::MAX as usize;

/// Final size of the overlay, fixed for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetGeometry {
    pub width: u32,
    pub height: u32,
}

impl TargetGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        (self.width as usize).saturating_mul(BYTES_PER_PIXEL)
    }

    /// Bytes per frame. Saturates; `checked_byte_len` reports overflow.
    pub fn byte_len(&self) -> usize {
        self.stride().saturating_mul(self.height as usize)
    }

    pub fn checked_byte_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(BYTES_PER_PIXEL)?
            .checked_mul(self.height as usize)
    }

    /// Reject frames that cannot be shared with the compositor
    pub fn validate(self) -> Result<Self, OverlayError> {
        match self.checked_byte_len() {
            Some(len) if len <= MAX_FRAME_BYTES => Ok(self),
            _ => Err(OverlayError::Allocation(format!(
                "{}x{} overlay exceeds the {} byte frame limit",
                self.width, self.height, MAX_FRAME_BYTES
            ))),
        }
    }
}

/// Resolve the overlay size.
///
/// A zero request means "not given": both zero keeps the intrinsic size,
/// one zero derives that side from the intrinsic aspect ratio, and two
/// non-zero values are used as-is.
pub fn resolve(
    requested_width: u32,
    requested_height: u32,
    intrinsic_width: u32,
    intrinsic_height: u32,
) -> Result<TargetGeometry, OverlayError> {
    if intrinsic_width == 0 || intrinsic_height == 0 {
        return Err(OverlayError::ZeroSizedImage {
            width: intrinsic_width,
            height: intrinsic_height,
        });
    }

    let geometry = match (requested_width, requested_height) {
        (0, 0) => TargetGeometry::new(intrinsic_width, intrinsic_height),
        (w, 0) => TargetGeometry::new(w, scale_side(w, intrinsic_height, intrinsic_width)?),
        (0, h) => TargetGeometry::new(scale_side(h, intrinsic_width, intrinsic_height)?, h),
        (w, h) => TargetGeometry::new(w, h),
    };

    geometry.validate()
}

/// `round(given * numerator / denominator)`, never below one pixel
fn scale_side(given: u32, numerator: u32, denominator: u32) -> Result<u32, OverlayError> {
    let exact = (given as f64 * numerator as f64 / denominator as f64).round();
    if exact > u32::MAX as f64 {
        return Err(OverlayError::Allocation(format!(
            "derived side of {exact} pixels does not fit in 32 bits"
        )));
    }
    Ok((exact as u32).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_zero_keeps_intrinsic() {
        assert_eq!(resolve(0, 0, 640, 480).unwrap(), TargetGeometry::new(640, 480));
        assert_eq!(resolve(0, 0, 1, 1).unwrap(), TargetGeometry::new(1, 1));
    }

    #[test]
    fn width_only_derives_height() {
        assert_eq!(resolve(200, 0, 100, 50).unwrap(), TargetGeometry::new(200, 100));
        // 100 * 2 / 3 = 66.67
        assert_eq!(resolve(100, 0, 3, 2).unwrap(), TargetGeometry::new(100, 67));
    }

    #[test]
    fn height_only_derives_width() {
        assert_eq!(resolve(0, 100, 100, 50).unwrap(), TargetGeometry::new(200, 100));
        assert_eq!(resolve(0, 10, 3, 7).unwrap(), TargetGeometry::new(4, 10));
    }

    #[test]
    fn both_given_ignores_aspect() {
        assert_eq!(resolve(10, 300, 100, 50).unwrap(), TargetGeometry::new(10, 300));
    }

    #[test]
    fn aspect_preserved_within_rounding() {
        let intrinsic = [(100, 50), (1920, 1080), (37, 91), (1, 500), (500, 1)];
        for &(iw, ih) in &intrinsic {
            for w in [1u32, 7, 64, 333, 1000] {
                let g = resolve(w, 0, iw, ih).unwrap();
                let exact = w as f64 * ih as f64 / iw as f64;
                assert!((g.height as f64 - exact).abs() <= 0.5 || g.height == 1);
                assert_eq!(g.width, w);
            }
            for h in [1u32, 9, 120, 777] {
                let g = resolve(0, h, iw, ih).unwrap();
                let exact = h as f64 * iw as f64 / ih as f64;
                assert!((g.width as f64 - exact).abs() <= 0.5 || g.width == 1);
                assert_eq!(g.height, h);
            }
        }
    }

    #[test]
    fn zero_intrinsic_fails_fast() {
        assert!(matches!(
            resolve(10, 0, 0, 50),
            Err(OverlayError::ZeroSizedImage { .. })
        ));
        assert!(resolve(0, 10, 50, 0).is_err());
        assert!(resolve(0, 0, 0, 0).is_err());
    }

    #[test]
    fn overflowing_request_is_an_allocation_error() {
        let err = resolve(u32::MAX, u32::MAX, 1, 1).unwrap_err();
        assert!(matches!(err, OverlayError::Allocation(_)));

        let g = TargetGeometry::new(u32::MAX, u32::MAX);
        assert_eq!(g.checked_byte_len(), None);
        assert_eq!(g.byte_len(), usize::MAX);
        assert!(g.validate().is_err());
    }

    #[test]
    fn derived_side_past_u32_is_rejected() {
        // 4_000_000_000 * 1000 / 1 does not fit in a u32
        let err = resolve(0, 4_000_000_000, 1000, 1).unwrap_err();
        assert!(matches!(err, OverlayError::Allocation(_)));
    }

    #[test]
    fn frame_over_wl_shm_limit_is_rejected() {
        // 60000 * 60000 * 4 = 14.4 GB
        assert!(matches!(
            resolve(60_000, 60_000, 10, 10),
            Err(OverlayError::Allocation(_))
        ));
        // Largest square that still fits: 23170^2 * 4 < i32::MAX
        assert!(resolve(23_170, 23_170, 10, 10).is_ok());
        assert!(resolve(23_171, 23_171, 10, 10).is_err());
    }

    #[test]
    fn buffer_sizes() {
        let g = TargetGeometry::new(200, 100);
        assert_eq!(g.stride(), 800);
        assert_eq!(g.byte_len(), 200 * 100 * 4);
    }
}
