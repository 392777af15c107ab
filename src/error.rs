//! Error types for the detection pipeline

use thiserror::Error;

use crate::detection::Provider;

/// Failures raised by recognition backends, the frame source and the normalizer.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Image encoding error: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Empty frame: nothing to analyze")]
    EmptyFrame,
}

impl DetectionError {
    pub fn missing_credential(provider: Provider) -> Self {
        DetectionError::Configuration(format!("{} API key not configured", provider.display_name()))
    }
}

/// Reasons the monitor refuses to leave the idle state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("a target phrase is required before monitoring can start")]
    EmptyPrompt,

    #[error("no credential configured for provider {0}")]
    MissingCredential(Provider),
}
