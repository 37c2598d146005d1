//! Data-URI image decoding.
//!
//! Payloads look like `data:image/jpeg;base64,<body>`. Everything up to the
//! first comma is metadata and ignored; the format is sniffed from the bytes.

use crate::types::RasterImage;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("missing ',' between data-URI prefix and payload")]
    MissingSeparator,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not a supported image: {0}")]
    Image(#[from] image::ImageError),
}

/// Decode a `<prefix>,<base64>` string into an RGB raster.
pub fn decode_data_uri(payload: &str) -> Result<RasterImage, DecodeError> {
    let (_, body) = payload
        .split_once(',')
        .ok_or(DecodeError::MissingSeparator)?;
    let bytes = STANDARD.decode(body.trim())?;
    decode_bytes(&bytes)
}

/// Decode raw encoded image bytes (PNG, JPEG, ...) into an RGB raster.
pub fn decode_bytes(bytes: &[u8]) -> Result<RasterImage, DecodeError> {
    let decoded = image::load_from_memory(bytes)?;
    Ok(RasterImage::from_rgb(decoded.to_rgb8()))
}
