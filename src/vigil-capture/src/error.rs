//! Capture error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid source url: {0}")]
    InvalidUrl(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("gave up on {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
