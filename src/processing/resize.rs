//! # Aspect-Preserving Rescale
//!
//! Images are scaled uniformly so they fit a bounding box (1280×720 by default):
//!
//! ```text
//! scale      = min(max_width / width, max_height / height)
//! new_width  = round(width  * scale)
//! new_height = round(height * scale)
//! ```
//!
//! The same factor applies to both sides, so the aspect ratio survives up to
//! rounding. Smaller images are scaled up to the box as well; the processing
//! service expects inputs normalised to the box.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageOutputFormat};
use std::io::Cursor;

use crate::common::config::ImageConfig;

/// Maximum dimensions of an uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBounds {
    pub max_width: u32,
    pub max_height: u32,
}

impl ImageBounds {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width,
            max_height,
        }
    }
}

impl Default for ImageBounds {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl From<&ImageConfig> for ImageBounds {
    fn from(config: &ImageConfig) -> Self {
        Self::new(config.max_width, config.max_height)
    }
}

/// Target size for a `width`×`height` image inside `bounds`.
///
/// Each side is at least 1 pixel and never exceeds its bound.
pub fn fit_within(width: u32, height: u32, bounds: ImageBounds) -> (u32, u32) {
    if width == 0 || height == 0 || bounds.max_width == 0 || bounds.max_height == 0 {
        return (width, height);
    }

    let scale = f64::min(
        bounds.max_width as f64 / width as f64,
        bounds.max_height as f64 / height as f64,
    );

    let new_width = ((width as f64 * scale).round() as u32).clamp(1, bounds.max_width);
    let new_height = ((height as f64 * scale).round() as u32).clamp(1, bounds.max_height);
    (new_width, new_height)
}

/// Rescale `image` to fit `bounds`, returning it untouched when it already matches.
pub fn resize_to_bounds(image: &DynamicImage, bounds: ImageBounds) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = fit_within(width, height, bounds);

    if (new_width, new_height) == (width, height) {
        return image.clone();
    }
    image.resize_exact(new_width, new_height, FilterType::Triangle)
}

/// Encode as PNG.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, ImageError> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;
    Ok(bytes)
}

/// Decode any format the `image` crate recognises.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    image::load_from_memory(bytes)
}
