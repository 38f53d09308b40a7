//! # Image Preparation
//!
//! Turns a captured or picked image into the PNG payload that is uploaded, and
//! decodes the processed preview that comes back over the broker.

pub mod payload;
pub mod resize;

pub use payload::ImagePayload;
pub use resize::{decode_image, encode_png, fit_within, resize_to_bounds, ImageBounds};
