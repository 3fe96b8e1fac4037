//! The RGBA8 bitmap container fed into the pipeline.
//!
//! A [`Bitmap`] is never rejected at construction time. Inconsistent
//! dimensions produce an *invalid* bitmap that every stage treats as a
//! no-op; [`crate::process`] reports it as [`PipelineError::InvalidBitmap`].

use image::RgbaImage;

use crate::types::{Color, Dimensions, PipelineError};

/// Width, height and a row-major RGBA8 buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
    valid: bool,
}

/// Byte length of a `width × height` RGBA buffer, or `None` on overflow.
fn rgba_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(4)
}

impl Bitmap {
    /// Wrap an RGBA buffer.
    ///
    /// The result is invalid when either dimension is zero, the byte
    /// size overflows, or `data` has the wrong length.
    #[must_use]
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        let valid = width > 0
            && height > 0
            && rgba_len(width, height).is_some_and(|len| len == data.len());
        Self {
            width,
            height,
            data,
            valid,
        }
    }

    /// A fully transparent bitmap.
    #[must_use]
    pub fn blank(width: u32, height: u32) -> Self {
        let len = rgba_len(width, height).unwrap_or(0);
        Self::new(width, height, vec![0; len])
    }

    /// Build a bitmap by evaluating `f` at every pixel.
    #[must_use]
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> Color) -> Self {
        let mut bitmap = Self::blank(width, height);
        if bitmap.valid {
            for y in 0..height {
                for x in 0..width {
                    bitmap.set_pixel(x, y, f(x, y));
                }
            }
        }
        bitmap
    }

    /// Decode raw image bytes (PNG, JPEG, BMP, WebP).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
    /// Returns [`PipelineError::ImageDecode`] if the image format is
    /// unrecognized or the data is corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from(img.to_rgba8()))
    }

    /// Whether dimensions and buffer length agree.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// `Ok(())` for a valid bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidBitmap`] describing the mismatch.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.valid {
            Ok(())
        } else {
            Err(PipelineError::InvalidBitmap {
                width: self.width,
                height: self.height,
                len: self.data.len(),
            })
        }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Width and height.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    /// The raw RGBA buffer.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        (self.valid && x < self.width && y < self.height)
            .then(|| (y as usize * self.width as usize + x as usize) * 4)
    }

    /// Pixel at `(x, y)`; out-of-range reads return transparent black.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Color {
        self.offset(x, y).map_or(Color::TRANSPARENT, |i| {
            Color::new(
                self.data[i],
                self.data[i + 1],
                self.data[i + 2],
                self.data[i + 3],
            )
        })
    }

    /// One channel (0 = R .. 3 = A); out-of-range reads return 0.
    #[must_use]
    pub fn channel(&self, x: u32, y: u32, c: usize) -> u8 {
        match self.offset(x, y) {
            Some(i) if c < 4 => self.data[i + c],
            _ => 0,
        }
    }

    /// Overwrite a pixel; out-of-range writes are ignored.
    pub fn set_pixel(&mut self, x: u32, y: u32, color: Color) {
        if let Some(i) = self.offset(x, y) {
            self.data[i..i + 4].copy_from_slice(&color.channels());
        }
    }

    /// Overwrite one channel; out-of-range writes are ignored.
    pub fn set_channel(&mut self, x: u32, y: u32, c: usize, value: u8) {
        if let Some(i) = self.offset(x, y)
            && c < 4
        {
            self.data[i + c] = value;
        }
    }

    /// Whether any pixel is below the transparency threshold.
    #[must_use]
    pub fn has_transparency(&self) -> bool {
        self.data.chunks_exact(4).any(|px| px[3] < crate::types::TRANSPARENT_ALPHA)
    }

    /// Copy into an `image` buffer, or `None` for an invalid bitmap.
    #[must_use]
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        if !self.valid {
            return None;
        }
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
    }
}

impl From<RgbaImage> for Bitmap {
    fn from(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self::new(width, height, img.into_raw())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimensions_are_invalid() {
        assert!(!Bitmap::new(0, 4, vec![]).is_valid());
        assert!(!Bitmap::new(4, 0, vec![]).is_valid());
        assert!(Bitmap::new(0, 4, vec![]).check().is_err());
    }

    #[test]
    fn wrong_length_is_invalid() {
        assert!(!Bitmap::new(2, 2, vec![0; 15]).is_valid());
        assert!(Bitmap::new(2, 2, vec![0; 16]).is_valid());
    }

    #[test]
    fn overflowing_size_is_invalid_without_allocating() {
        let b = Bitmap::blank(u32::MAX, u32::MAX);
        // The byte size overflows usize, so nothing is allocated.
        assert!(!b.is_valid());
        assert_eq!(b.pixel(0, 0), Color::TRANSPARENT);
    }

    #[test]
    fn out_of_range_access_is_harmless() {
        let mut b = Bitmap::blank(2, 2);
        b.set_pixel(5, 5, Color::rgb(1, 2, 3));
        b.set_channel(0, 0, 9, 7);
        assert_eq!(b.pixel(5, 5), Color::TRANSPARENT);
        assert_eq!(b.channel(0, 0, 9), 0);
        assert!(b.data().iter().all(|&v| v == 0));
    }

    #[test]
    fn pixel_roundtrip() {
        let mut b = Bitmap::blank(3, 2);
        b.set_pixel(2, 1, Color::new(10, 20, 30, 40));
        assert_eq!(b.pixel(2, 1), Color::new(10, 20, 30, 40));
        assert_eq!(b.channel(2, 1, 2), 30);
    }

    #[test]
    fn empty_input_returns_error() {
        assert!(matches!(Bitmap::decode(&[]), Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn corrupt_bytes_returns_image_decode_error() {
        let result = Bitmap::decode(&[0xFF, 0xFE, 0x00, 0x01]);
        assert!(matches!(result, Err(PipelineError::ImageDecode(_))));
    }

    #[test]
    fn valid_png_decodes_to_rgba() {
        let img = RgbaImage::from_fn(2, 2, |x, _| image::Rgba([255, 0, 0, if x == 0 { 0 } else { 255 }]));
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgba8,
        )
        .unwrap();

        let bitmap = Bitmap::decode(&buf).unwrap();
        assert!(bitmap.is_valid());
        assert_eq!(bitmap.pixel(1, 1), Color::rgb(255, 0, 0));
        assert!(bitmap.has_transparency());
        assert_eq!(bitmap.to_rgba_image().unwrap(), img);
    }
}
