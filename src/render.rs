//! Turning pixel intensities into something a person can look at.

use std::path::Path;

use image::GrayImage;

use crate::errors::{RuntimeError, RuntimeResult};

const ASCII_RAMP: &[u8] = b" .:-=+*#%@";

/// Side length of a square image with `pixels` pixels, if it is square.
pub fn square_side(pixels: usize) -> Option<usize> {
    let side = (pixels as f64).sqrt().round() as usize;
    (side * side == pixels).then_some(side)
}

/// Maps intensities in `[0, 1]` to grayscale bytes. Out of range values are
/// clamped.
pub fn grayscale_bytes(image: &[f32]) -> Vec<u8> {
    image
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect()
}

fn dimensions(pixels: usize, width: usize) -> RuntimeResult<(u32, u32)> {
    if width == 0 || pixels % width != 0 {
        return Err(RuntimeError::InvalidImageShape { pixels, width });
    }
    Ok((width as u32, (pixels / width) as u32))
}

pub fn to_gray_image(image: &[f32], width: usize) -> RuntimeResult<GrayImage> {
    let (w, h) = dimensions(image.len(), width)?;
    GrayImage::from_raw(w, h, grayscale_bytes(image)).ok_or(RuntimeError::InvalidImageShape {
        pixels: image.len(),
        width,
    })
}

/// Writes the image as a PNG file.
pub fn save_png(image: &[f32], width: usize, path: impl AsRef<Path>) -> RuntimeResult<()> {
    let path = path.as_ref();
    to_gray_image(image, width)?
        .save(path)
        .map_err(|source| RuntimeError::ImageWrite {
            path: path.display().to_string(),
            source,
        })
}

/// Renders the image as text, one character per pixel.
pub fn ascii_preview(image: &[f32], width: usize) -> RuntimeResult<String> {
    dimensions(image.len(), width)?;
    let last = (ASCII_RAMP.len() - 1) as f32;
    let mut out = String::with_capacity(image.len() + image.len() / width);
    for row in image.chunks(width) {
        for v in row {
            let level = (v.clamp(0.0, 1.0) * last).round() as usize;
            out.push(char::from(ASCII_RAMP[level]));
        }
        out.push('\n');
    }
    Ok(out)
}
