//! Face crop → recognition-model input tensor.

use crate::types::RasterImage;
use image::imageops::FilterType;
use ndarray::Array4;

/// Side length of the square the recognition model expects.
pub const FACE_INPUT_SIZE: u32 = 112;

/// `[batch, channel, height, width]` of every [`NormalizedTensor`].
pub const NORMALIZED_SHAPE: [usize; 4] = [1, 3, FACE_INPUT_SIZE as usize, FACE_INPUT_SIZE as usize];

/// 1×3×112×112, RGB planes, values in [0, 1].
pub type NormalizedTensor = Array4<f32>;

/// Resize a face crop to 112×112 and lay it out as a scaled RGB NCHW tensor.
///
/// Order is fixed: bilinear resize, RGB channel planes, divide by 255,
/// channel-first with a leading batch of one. The recognizer is trained on
/// exactly this layout and value range.
pub fn normalize_face(face: &RasterImage) -> NormalizedTensor {
    let size = FACE_INPUT_SIZE;
    let resized = image::imageops::resize(face.as_rgb(), size, size, FilterType::Triangle);

    let mut tensor = NormalizedTensor::zeros(NORMALIZED_SHAPE);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = f32::from(r) / 255.0;
        tensor[[0, 1, y, x]] = f32::from(g) / 255.0;
        tensor[[0, 2, y, x]] = f32::from(b) / 255.0;
    }

    tensor
}
