//! The upload unit handed from the coordinator to the transport.

use image::{DynamicImage, ImageError};

use super::resize::{encode_png, resize_to_bounds, ImageBounds};

/// PNG bytes plus the file name used for the multipart part.
///
/// Owned by the upload coordinator until it is moved into the transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub file_name: String,
}

impl ImagePayload {
    pub const MIME_TYPE: &'static str = "image/png";

    /// Rescale `image` to `bounds` and encode it as PNG.
    pub fn from_image(
        image: &DynamicImage,
        bounds: ImageBounds,
        file_name: impl Into<String>,
    ) -> Result<Self, ImageError> {
        let resized = resize_to_bounds(image, bounds);
        Ok(Self {
            bytes: encode_png(&resized)?,
            file_name: file_name.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::resize::decode_image;
    use image::{GenericImageView, RgbaImage};

    #[test]
    fn test_payload_is_png_within_bounds() {
        let photo = DynamicImage::ImageRgba8(RgbaImage::new(4000, 3000));
        let payload = ImagePayload::from_image(&photo, ImageBounds::default(), "imageCapture.png").unwrap();

        assert_eq!(payload.file_name, "imageCapture.png");
        assert!(!payload.is_empty());
        assert_eq!(decode_image(&payload.bytes).unwrap().dimensions(), (960, 720));
    }
}
