//! Error handling for the discovery engine
//!
//! A single error enum covers the failure classes of a run. The scheduler
//! treats most of them as non-terminal: a failed probe is an empty result,
//! a failed report delivery is logged and the job continues.

use thiserror::Error;

/// Main error type for discovery operations
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("probe error: {0}")]
    ProbeError(String),

    #[error("snmp error: {0}")]
    SnmpError(String),

    #[error("report error: {0}")]
    ReportError(String),

    #[error("xml error: {0}")]
    XmlError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

impl From<std::net::AddrParseError> for DiscoveryError {
    fn from(e: std::net::AddrParseError) -> Self {
        DiscoveryError::InvalidRange(e.to_string())
    }
}

impl From<std::num::ParseIntError> for DiscoveryError {
    fn from(e: std::num::ParseIntError) -> Self {
        DiscoveryError::ConfigError(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DiscoveryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DiscoveryError::ProbeError("timeout".to_string())
    }
}
