// Image loading module
// Decodes the source file into a fixed RGBA8 pixel buffer

use crate::error::OverlayError;
use image::DynamicImage;
use std::fs;
use std::io::Cursor;
use std::path::Path;

/// Decoded image ready for scaling
#[derive(Debug, Clone)]
pub struct SourceImage {
    /// Intrinsic width in pixels
    pub width: u32,
    /// Intrinsic height in pixels
    pub height: u32,
    /// Straight-alpha RGBA pixel data (4 bytes per pixel)
    pub rgba: Vec<u8>,
}

impl SourceImage {
    /// Wrap an existing RGBA buffer, rejecting empty or mis-sized data
    pub fn from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, OverlayError> {
        if width == 0 || height == 0 {
            return Err(OverlayError::ZeroSizedImage { width, height });
        }
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(OverlayError::Decode(format!(
                "pixel buffer holds {} bytes, expected {expected}",
                rgba.len()
            )));
        }
        Ok(Self { width, height, rgba })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Load an image file and force it to four channels
pub fn load_image(path: &Path) -> Result<SourceImage, OverlayError> {
    let data = fs::read(path).map_err(|e| {
        OverlayError::Decode(format!("failed to read {}: {e}", path.display()))
    })?;
    let img = load_from_bytes(&data)?;

    // Sources without alpha get a fully opaque channel here
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    SourceImage::from_rgba(width, height, rgba.into_raw())
}

/// Load an image from raw bytes, auto-detecting the format
fn load_from_bytes(data: &[u8]) -> Result<DynamicImage, OverlayError> {
    let format = image::guess_format(data)
        .map_err(|e| OverlayError::Decode(format!("unrecognized format: {e}")))?;

    image::load(Cursor::new(data), format).map_err(|e| OverlayError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use tempfile::NamedTempFile;

    fn write_png(img: DynamicImage) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        img.save_with_format(file.path(), ImageFormat::Png).unwrap();
        file
    }

    #[test]
    fn rgb_source_gets_opaque_alpha() {
        let img = RgbImage::from_pixel(3, 2, Rgb([10, 20, 30]));
        let file = write_png(DynamicImage::ImageRgb8(img));

        let loaded = load_image(file.path()).unwrap();
        assert_eq!(loaded.dimensions(), (3, 2));
        assert_eq!(loaded.rgba.len(), 3 * 2 * 4);
        for px in loaded.rgba.chunks_exact(4) {
            assert_eq!(px, [10, 20, 30, 255]);
        }
    }

    #[test]
    fn rgba_source_keeps_alpha() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4]));
        let file = write_png(DynamicImage::ImageRgba8(img));

        let loaded = load_image(file.path()).unwrap();
        assert_eq!(&loaded.rgba[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"definitely not an image").unwrap();
        assert!(matches!(load_image(file.path()), Err(OverlayError::Decode(_))));
    }

    #[test]
    fn truncated_png_is_a_decode_error() {
        let img = RgbaImage::from_pixel(16, 16, Rgba([9, 9, 9, 9]));
        let file = write_png(DynamicImage::ImageRgba8(img));
        let bytes = std::fs::read(file.path()).unwrap();
        std::fs::write(file.path(), &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(load_image(file.path()), Err(OverlayError::Decode(_))));
    }

    #[test]
    fn unreadable_path_is_a_decode_error() {
        let err = load_image(Path::new("/no/such/image.png")).unwrap_err();
        assert!(matches!(err, OverlayError::Decode(_)));
    }

    #[test]
    fn empty_dimensions_are_rejected() {
        let err = SourceImage::from_rgba(0, 10, Vec::new()).unwrap_err();
        assert!(matches!(err, OverlayError::ZeroSizedImage { width: 0, height: 10 }));
    }
}
