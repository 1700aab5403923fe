//! Error types for the WFIREX4 device client.
//!
//! Device operations return structured errors; the CLI and the
//! simulator wrap them in `anyhow` at the edges.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Every failure a device operation can report.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// TCP connect refused, unreachable or timed out
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// A single read took longer than the per-read timeout
    #[error("read from {addr} timed out after {timeout:?}")]
    ReadTimeout { addr: String, timeout: Duration },

    /// Write or read failure on an open connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or empty device response
    #[error("malformed response: {0}")]
    Format(String),

    /// A raw or base64 code that could not be decoded
    #[error("invalid code: {0}")]
    InvalidCode(String),

    /// Command name not present in the code library
    #[error("command '{command}' not found for device '{device}'")]
    CommandNotFound { device: String, command: String },

    /// A library lookup was requested without a device name
    #[error("a device must be specified to look up '{command}'")]
    MissingDevice { command: String },

    /// Learning produced no usable code
    #[error("learn failed: {0}")]
    Learn(String),

    /// Every fetch attempt failed
    #[error("sensor fetch from {host}:{port} failed after {attempts} attempt(s): {source}")]
    FetchFailed {
        host: String,
        port: u16,
        attempts: u32,
        #[source]
        source: Box<DeviceError>,
    },

    /// Persisting or loading codes/flags failed
    #[error("storage error: {0}")]
    Store(String),

    /// The remote is administratively turned off
    #[error("remote is turned off")]
    Disabled,
}

impl DeviceError {
    /// Resolution failures that skip a single command inside a batch
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            DeviceError::InvalidCode(_)
                | DeviceError::CommandNotFound { .. }
                | DeviceError::MissingDevice { .. }
        )
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(e: serde_json::Error) -> Self {
        DeviceError::Store(e.to_string())
    }
}
