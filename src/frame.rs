use image::RgbImage;
use image::imageops::{self, FilterType};
use std::time::{Instant, SystemTime};

/// Interpolation used for every resize. Fixed so a given input size always
/// produces the same output.
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// A decoded, resized frame as published to the latest-frame slot.
#[derive(Clone, Debug)]
pub struct Frame {
    pub sequence: u64,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
    /// Monotonic capture time, from the reader's clock.
    pub captured_instant: Instant,
    pub image: RgbImage,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Raw RGB8 bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }
}

/// Resizes `image` to exactly `width` x `height`. No-op if it already matches.
pub fn resize_to(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image;
    }
    imageops::resize(&image, width, height, RESIZE_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn resize_hits_requested_shape() {
        let source = RgbImage::from_pixel(1920, 1080, Rgb([10, 20, 30]));
        let resized = resize_to(source, 320, 240);
        assert_eq!(resized.dimensions(), (320, 240));
        // Solid input stays solid through the filter.
        assert_eq!(resized.get_pixel(160, 120), &Rgb([10, 20, 30]));
    }

    #[test]
    fn resize_is_deterministic() {
        let source = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 7]));
        let a = resize_to(source.clone(), 17, 13);
        let b = resize_to(source, 17, 13);
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn matching_shape_is_untouched() {
        let source = RgbImage::from_fn(8, 8, |x, y| Rgb([x as u8, y as u8, 0]));
        let same = resize_to(source.clone(), 8, 8);
        assert_eq!(same.as_raw(), source.as_raw());
    }
}
