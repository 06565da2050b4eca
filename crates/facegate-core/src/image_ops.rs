//! Image decoding and the single resize/normalize step the classifier needs.
//!
//! Grayscale conversion and bilinear resizing follow OpenCV's `COLOR_RGB2GRAY`
//! and `INTER_LINEAR` conventions, since the classifier was trained on crops
//! produced that way.

use crate::types::FaceRect;
use base64::Engine;
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use ndarray::Array4;
use thiserror::Error;

/// Side length of the square face crop fed to the classifier.
pub const FACE_INPUT_SIZE: usize = 100;

// BT.601 luma weights in 14-bit fixed point, as used by OpenCV.
const GRAY_R: u32 = 4899;
const GRAY_G: u32 = 9617;
const GRAY_B: u32 = 1868;
const GRAY_SHIFT: u32 = 14;

#[derive(Error, Debug)]
pub enum ImageDecodeError {
    #[error("image payload has no ',' separator")]
    MissingSeparator,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("cannot decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("face region {0:?} lies outside the {1}x{2} image")]
    EmptyCrop(FaceRect, u32, u32),
}

/// Extract and decode the base64 payload of a `<prefix>,<payload>` string.
///
/// Takes the segment after the first comma and before any second one.
pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>, ImageDecodeError> {
    let payload = data_url
        .split(',')
        .nth(1)
        .ok_or(ImageDecodeError::MissingSeparator)?;
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(base64::engine::general_purpose::STANDARD.decode(compact)?)
}

/// Decode encoded image bytes (PNG, JPEG, ...) into a 3-channel raster.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, ImageDecodeError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// RGB → 8-bit grayscale with BT.601 weights.
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let weighted = r as u32 * GRAY_R + g as u32 * GRAY_G + b as u32 * GRAY_B;
        let v = (weighted + (1 << (GRAY_SHIFT - 1))) >> GRAY_SHIFT;
        Luma([v.min(255) as u8])
    })
}

/// Crop `gray` to `rect`, clamped to the image bounds.
pub fn crop(gray: &GrayImage, rect: FaceRect) -> Result<GrayImage, ImageDecodeError> {
    let r = rect
        .clamp_to(gray.width(), gray.height())
        .ok_or(ImageDecodeError::EmptyCrop(rect, gray.width(), gray.height()))?;
    Ok(image::imageops::crop_imm(gray, r.x as u32, r.y as u32, r.width as u32, r.height as u32)
        .to_image())
}

/// Bilinear resize with pixel-centre alignment.
///
/// Source coordinates map as `(dst + 0.5) * scale - 0.5`, clamped at the
/// borders, so downscaling does no area averaging.
pub fn resize_bilinear(src: &GrayImage, new_w: u32, new_h: u32) -> GrayImage {
    let (width, height) = (src.width() as usize, src.height() as usize);
    let mut out = GrayImage::new(new_w, new_h);
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return out;
    }

    let frame = src.as_raw();
    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;

    for y in 0..new_h as usize {
        let src_y = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (src_y.floor() as usize).min(height - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fy = if y0 == height - 1 { 0.0 } else { src_y - y0 as f32 };

        for x in 0..new_w as usize {
            let src_x = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (src_x.floor() as usize).min(width - 1);
            let x1 = (x0 + 1).min(width - 1);
            let fx = if x0 == width - 1 { 0.0 } else { src_x - x0 as f32 };

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            out.put_pixel(x as u32, y as u32, Luma([val.round().clamp(0.0, 255.0) as u8]));
        }
    }

    out
}

/// Resize a face crop to the classifier input size and scale it into a
/// `(1, H, W, 1)` tensor with values in `[0, 1]`.
pub fn face_tensor(face: &GrayImage) -> Array4<f32> {
    let size = FACE_INPUT_SIZE;
    let resized = resize_bilinear(face, size as u32, size as u32);
    let mut tensor = Array4::<f32>::zeros((1, size, size, 1));
    for (x, y, px) in resized.enumerate_pixels() {
        tensor[[0, y as usize, x as usize, 0]] = px.0[0] as f32 / 255.0;
    }
    tensor
}
