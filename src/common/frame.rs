use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::TransportError;

/// Structured per-frame data, keyed by name. Order is not significant.
pub type Metadata = Map<String, Value>;

/// Channel order of the pixel buffer carried by a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    #[default]
    Rgb,
    Bgr,
}

impl PixelFormat {
    pub fn tag(self) -> u8 {
        match self {
            PixelFormat::Rgb => 0,
            PixelFormat::Bgr => 1,
        }
    }

    /// Reorders an RGB triple into this channel order.
    pub fn arrange(self, rgb: [u8; 3]) -> [u8; 3] {
        match self {
            PixelFormat::Rgb => rgb,
            PixelFormat::Bgr => [rgb[2], rgb[1], rgb[0]],
        }
    }
}

impl TryFrom<u8> for PixelFormat {
    type Error = TransportError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(PixelFormat::Rgb),
            1 => Ok(PixelFormat::Bgr),
            _ => Err(TransportError::InvalidPixelFormat(tag)),
        }
    }
}

/// One unit of work flowing through the pipeline: an image and its metadata.
///
/// The pixel buffer sits behind an `Arc`, so cloning a frame (for fan-out to
/// several consumers) never copies pixels. Writing goes through
/// [`Frame::image_mut`], which copies the buffer first if anyone else still
/// holds it, so a published frame is never changed under a reader.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    format: PixelFormat,
    data: Metadata,
}

impl Frame {
    pub fn new(image: RgbImage, data: Metadata, format: PixelFormat) -> Self {
        Self {
            image: Arc::new(image),
            format,
            data,
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self::new(image, Metadata::new(), PixelFormat::Rgb)
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn shared_image(&self) -> Arc<RgbImage> {
        Arc::clone(&self.image)
    }

    /// Writable view of the pixels, detached from every other holder.
    pub fn image_mut(&mut self) -> &mut RgbImage {
        Arc::make_mut(&mut self.image)
    }

    /// The image in RGB order, converting a BGR buffer on the way.
    pub fn rgb_image(&self) -> Arc<RgbImage> {
        match self.format {
            PixelFormat::Rgb => self.shared_image(),
            PixelFormat::Bgr => {
                let mut image = (*self.image).clone();
                for pixel in image.pixels_mut() {
                    pixel.0.swap(0, 2);
                }
                Arc::new(image)
            }
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn data(&self) -> &Metadata {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Metadata {
        &mut self.data
    }

    pub fn into_parts(self) -> (Arc<RgbImage>, Metadata, PixelFormat) {
        (self.image, self.data, self.format)
    }

    pub fn from_parts(image: Arc<RgbImage>, data: Metadata, format: PixelFormat) -> Self {
        Self {
            image,
            format,
            data,
        }
    }
}
