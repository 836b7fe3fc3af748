use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;

use crate::core::types::OutputFormat;

/// Asynchronously decode an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large images.
pub async fn load_image_from_memory_async(bytes: Vec<u8>) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to load image from memory")
    })
    .await
    .context("Failed to spawn blocking task for image loading")?
}

/// Encode an RGBA canvas in the requested output format.
///
/// JPEG has no alpha channel, so the canvas is flattened to RGB first.
pub fn encode_image(img: RgbaImage, format: OutputFormat) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    match format {
        OutputFormat::Jpeg => DynamicImage::ImageRgba8(img)
            .to_rgb8()
            .write_to(&mut cursor, ImageFormat::Jpeg)
            .context("Failed to encode image as JPEG")?,
        OutputFormat::Png => img
            .write_to(&mut cursor, ImageFormat::Png)
            .context("Failed to encode image as PNG")?,
    }
    Ok(bytes)
}

/// Asynchronously encode an image using spawn_blocking.
pub async fn encode_image_async(img: RgbaImage, format: OutputFormat) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode_image(img, format))
        .await
        .context("Failed to spawn blocking task for image encoding")?
}

/// Base64 text form used for image bytes inside task messages
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .context("Invalid base64 image payload")
}
