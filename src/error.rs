//! Error types for the retrace engine

use std::io;
use thiserror::Error;

/// Result type alias for retrace operations
pub type Result<T> = std::result::Result<T, RetraceError>;

/// Main error type for retrace
#[derive(Error, Debug)]
pub enum RetraceError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing errors
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP wire parsing errors (capture and proxy)
    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    /// Protocol handler errors (frame translation, unexpected wire state)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No recorded mock matched an outgoing call
    #[error("No matching mock for outgoing call: {0}")]
    MockMiss(String),

    /// Test-case / mock / report persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Instrumentation layer errors (hooks, proxy wiring, app launch)
    #[error("Instrumentation error: {0}")]
    Instrumentation(String),

    /// Request simulation errors
    #[error("Simulation error: {0}")]
    Simulation(String),

    /// Engine is shutting down
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_yaml::Error> for RetraceError {
    fn from(err: serde_yaml::Error) -> Self {
        RetraceError::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for RetraceError {
    fn from(err: toml::de::Error) -> Self {
        RetraceError::ConfigParse(err.to_string())
    }
}

impl From<serde_json::Error> for RetraceError {
    fn from(err: serde_json::Error) -> Self {
        RetraceError::Internal(format!("JSON error: {}", err))
    }
}

impl From<regex::Error> for RetraceError {
    fn from(err: regex::Error) -> Self {
        RetraceError::Config(format!("Invalid regex pattern: {}", err))
    }
}

impl From<reqwest::Error> for RetraceError {
    fn from(err: reqwest::Error) -> Self {
        RetraceError::Simulation(err.to_string())
    }
}

impl From<url::ParseError> for RetraceError {
    fn from(err: url::ParseError) -> Self {
        RetraceError::Simulation(format!("Invalid URL: {}", err))
    }
}
