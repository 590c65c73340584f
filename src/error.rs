//! Error types for sing-geoip.

use thiserror::Error;

/// Error type for sing-geoip operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Expected release or asset is missing upstream
    #[error("not found: {0}")]
    NotFound(String),

    /// Source image does not parse as a MaxMind DB
    #[error("malformed database: {0}")]
    MalformedDatabase(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network rejected by the output tree
    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// GeoIP database error
    #[error("GeoIP error: {0}")]
    GeoIp(String),

    /// Download error
    #[error("download error: {0}")]
    Download(#[from] reqwest::Error),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedDatabase(msg.into())
    }
}

/// Result type alias for sing-geoip operations.
pub type Result<T> = std::result::Result<T, Error>;
