// Image scaling module
// Resamples the decoded image to the overlay size in linear light

use crate::error::OverlayError;
use crate::geometry::TargetGeometry;
use crate::image_loader::SourceImage;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba};
use log::info;
use std::borrow::Cow;

type LinearImage = ImageBuffer<Rgba<f32>, Vec<f32>>;

/// The pixels every frame is packed from.
///
/// Owns the decoded image and, when the overlay size differs from it,
/// the resampled copy.
#[derive(Debug)]
pub struct ScaledImage {
    source: SourceImage,
    resized: Option<Vec<u8>>,
    geometry: TargetGeometry,
}

impl ScaledImage {
    pub fn new(source: SourceImage, geometry: TargetGeometry) -> Result<Self, OverlayError> {
        let resized = match scale(&source, geometry)? {
            Cow::Borrowed(_) => None,
            Cow::Owned(pixels) => Some(pixels),
        };
        Ok(Self {
            source,
            resized,
            geometry,
        })
    }

    /// Straight-alpha RGBA8 pixels at the overlay size
    pub fn pixels(&self) -> &[u8] {
        self.resized.as_deref().unwrap_or(&self.source.rgba)
    }

    pub fn geometry(&self) -> TargetGeometry {
        self.geometry
    }

    pub fn is_resized(&self) -> bool {
        self.resized.is_some()
    }
}

/// Scale the source pixels to `target`.
///
/// When the target matches the intrinsic size the source buffer is
/// borrowed untouched. Otherwise the image is converted to premultiplied
/// linear light, resampled with Lanczos3, and converted back to
/// straight-alpha sRGB RGBA8.
pub fn scale(source: &SourceImage, target: TargetGeometry) -> Result<Cow<'_, [u8]>, OverlayError> {
    if (source.width, source.height) == (target.width, target.height) {
        return Ok(Cow::Borrowed(&source.rgba));
    }
    if target.width == 0 || target.height == 0 {
        return Err(OverlayError::Resize(format!(
            "cannot resize to {}x{}",
            target.width, target.height
        )));
    }
    let target = target.validate()?;

    info!(
        "Resizing image {}x{} -> {}x{}",
        source.width, source.height, target.width, target.height
    );

    let linear = to_linear_premultiplied(source)?;
    let resized = imageops::resize(&linear, target.width, target.height, FilterType::Lanczos3);
    let rgba = to_srgb_straight(resized.as_raw());

    debug_assert_eq!(rgba.len(), target.byte_len());
    Ok(Cow::Owned(rgba))
}

fn to_linear_premultiplied(source: &SourceImage) -> Result<LinearImage, OverlayError> {
    let lut = srgb_to_linear_table();
    let mut data = Vec::new();
    data.try_reserve_exact(source.rgba.len())
        .map_err(|e| OverlayError::Resize(e.to_string()))?;

    for px in source.rgba.chunks_exact(4) {
        let alpha = px[3] as f32 / 255.0;
        data.push(lut[px[0] as usize] * alpha);
        data.push(lut[px[1] as usize] * alpha);
        data.push(lut[px[2] as usize] * alpha);
        data.push(alpha);
    }

    ImageBuffer::from_raw(source.width, source.height, data)
        .ok_or_else(|| OverlayError::Resize("source buffer does not match its dimensions".into()))
}

fn to_srgb_straight(data: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(4) {
        // Lanczos rings past the valid range near hard edges
        let alpha = px[3].clamp(0.0, 1.0);
        if alpha <= 0.0 {
            out.extend_from_slice(&[0, 0, 0, 0]);
            continue;
        }
        for &c in &px[..3] {
            out.push(linear_to_srgb((c / alpha).clamp(0.0, 1.0)));
        }
        out.push((alpha * 255.0).round() as u8);
    }
    out
}

fn srgb_to_linear_table() -> [f32; 256] {
    let mut table = [0.0f32; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let s = i as f32 / 255.0;
        *slot = if s <= 0.04045 {
            s / 12.92
        } else {
            ((s + 0.055) / 1.055).powf(2.4)
        };
    }
    table
}

fn linear_to_srgb(l: f32) -> u8 {
    let s = if l <= 0.003_130_8 {
        l * 12.92
    } else {
        1.055 * l.powf(1.0 / 2.4) - 0.055
    };
    (s * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, px: [u8; 4]) -> SourceImage {
        let rgba = px.repeat((width * height) as usize);
        SourceImage::from_rgba(width, height, rgba).unwrap()
    }

    #[test]
    fn identity_borrows_source() {
        let source = solid(5, 3, [1, 2, 3, 4]);
        let scaled = scale(&source, TargetGeometry::new(5, 3)).unwrap();
        assert!(matches!(scaled, Cow::Borrowed(_)));
        assert_eq!(scaled.as_ptr(), source.rgba.as_ptr());
        assert_eq!(&*scaled, &source.rgba[..]);
    }

    #[test]
    fn scaled_image_reuses_source_on_identity() {
        let source = solid(4, 4, [9, 8, 7, 6]);
        let ptr = source.rgba.as_ptr();
        let image = ScaledImage::new(source, TargetGeometry::new(4, 4)).unwrap();
        assert!(!image.is_resized());
        assert_eq!(image.pixels().as_ptr(), ptr);
    }

    #[test]
    fn scaled_image_owns_resampled_pixels() {
        let source = solid(100, 50, [10, 20, 30, 255]);
        let image = ScaledImage::new(source, TargetGeometry::new(200, 100)).unwrap();
        assert!(image.is_resized());
        assert_eq!(image.pixels().len(), image.geometry().byte_len());
    }

    #[test]
    fn scaled_length_matches_target() {
        let source = solid(100, 50, [10, 20, 30, 255]);
        let target = TargetGeometry::new(200, 100);
        let scaled = scale(&source, target).unwrap();
        assert!(matches!(scaled, Cow::Owned(_)));
        assert_eq!(scaled.len(), 200 * 100 * 4);
    }

    #[test]
    fn solid_color_survives_resampling() {
        let source = solid(8, 8, [200, 100, 50, 255]);
        let scaled = scale(&source, TargetGeometry::new(3, 5)).unwrap();
        for px in scaled.chunks_exact(4) {
            for (got, want) in px.iter().zip([200u8, 100, 50, 255]) {
                assert!(got.abs_diff(want) <= 1, "{px:?}");
            }
        }
    }

    #[test]
    fn transparent_pixels_do_not_bleed() {
        // Left half opaque red, right half fully transparent green
        let mut rgba = Vec::new();
        for _y in 0..8 {
            for x in 0..8 {
                if x < 4 {
                    rgba.extend_from_slice(&[255, 0, 0, 255]);
                } else {
                    rgba.extend_from_slice(&[0, 255, 0, 0]);
                }
            }
        }
        let source = SourceImage::from_rgba(8, 8, rgba).unwrap();
        let scaled = scale(&source, TargetGeometry::new(3, 3)).unwrap();
        for px in scaled.chunks_exact(4) {
            assert_eq!(px[1], 0, "green leaked into {px:?}");
        }
    }

    #[test]
    fn srgb_round_trips_every_level() {
        let lut = srgb_to_linear_table();
        for (i, &l) in lut.iter().enumerate() {
            assert_eq!(linear_to_srgb(l), i as u8);
        }
    }

    #[test]
    fn zero_target_is_a_resize_error() {
        let source = solid(2, 2, [0, 0, 0, 255]);
        assert!(matches!(
            scale(&source, TargetGeometry::new(0, 2)),
            Err(OverlayError::Resize(_))
        ));
    }

    #[test]
    fn oversized_target_fails_before_resampling() {
        let source = solid(1, 1, [255, 255, 255, 255]);
        assert!(matches!(
            scale(&source, TargetGeometry::new(60_000, 60_000)),
            Err(OverlayError::Allocation(_))
        ));
        assert!(matches!(
            ScaledImage::new(source, TargetGeometry::new(u32::MAX, u32::MAX)),
            Err(OverlayError::Allocation(_))
        ));
    }
}
