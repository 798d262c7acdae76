//! JPEG encode/decode for frames.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GenericImageView};

use crate::frame::Frame;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Encode a frame as a baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(frame.pixels().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(
            frame.pixels(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .context("encode jpeg")?;
    Ok(out)
}

/// Decode a JPEG (or any format the `image` crate was built with) into an RGB24 frame.
pub fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Frame::from_rgb(rgb.into_raw(), width, height)
}
