//! Centralised error type for the exporter.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP error calling `{operation}`: {source}")]
    Upstream {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("`{operation}` returned {status}: {body}")]
    UpstreamStatus {
        operation: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Malformed `{operation}` response: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Series `{0}` is already declared")]
    DuplicateSeries(String),

    #[error("Series `{0}` was never declared")]
    UnknownSeries(String),

    #[error("Labels do not match the declaration of `{series}`: {source}")]
    LabelMismatch {
        series: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Settings file {path:?}: {source}")]
    SettingsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings file {path:?} is not valid JSON: {source}")]
    SettingsFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("HTTP server error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl ExporterError {
    /// True when the failure came from the HarperDB side rather than from us.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ExporterError::Upstream { .. }
                | ExporterError::UpstreamStatus { .. }
                | ExporterError::Decode { .. }
        )
    }
}
