//! Error handling for the Skywatch daemon.

use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum OurError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Image decoding/encoding errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// PTZ transport errors
    #[error("Camera error: {0}")]
    Camera(String),

    /// Frame acquisition errors
    #[error("Capture error: {0}")]
    Capture(String),

    /// Generic application errors
    #[error("Application error: {0}")]
    App(String),
}

/// Application result type
pub type OurResult<T> = std::result::Result<T, OurError>;
