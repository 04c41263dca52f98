//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{message}")]
    Identity { message: String },

    #[error("failed to decode identity token: {message}")]
    IdentityDecode { message: String },

    #[error("chart is required")]
    ChartRequired,

    #[error("invalid chart reference '{chart}': {reason}")]
    InvalidChart { chart: String, reason: String },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid value '{expression}': {reason}")]
    InvalidValue { expression: String, reason: String },

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
