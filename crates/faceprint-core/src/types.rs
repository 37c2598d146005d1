use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Decoded color image, samples in R, G, B order.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    pixels: RgbImage,
}

impl RasterImage {
    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }

    /// Copy out the pixels covered by `region`.
    ///
    /// `region` is bounds-checked at construction, so this never reads past
    /// the source image.
    pub fn crop(&self, region: &FaceRegion) -> RasterImage {
        let view = image::imageops::crop_imm(
            &self.pixels,
            region.x,
            region.y,
            region.width,
            region.height,
        );
        RasterImage::from_rgb(view.to_image())
    }
}

/// Rectangular pixel region of a [`RasterImage`].
///
/// Always non-empty and fully inside the image it was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    /// Build a region, returning `None` if it is empty or leaves a
    /// `image_width` × `image_height` image.
    pub fn within(
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let right = x.checked_add(width)?;
        let bottom = y.checked_add(height)?;
        if right > image_width || bottom > image_height {
            return None;
        }
        Some(Self { x, y, width, height })
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Face box reported by a detector, in source-image pixel coordinates.
///
/// Coordinates may fall outside the image; the localizer clamps them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl Detection {
    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}
