//! Unified error types for tapnet

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Interface attribute that introspection could not resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingAttribute {
    Mac,
    Mask,
    Ipv4,
}

impl fmt::Display for MissingAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingAttribute::Mac => write!(f, "failed to get MAC address"),
            MissingAttribute::Mask => write!(f, "failed to find mask"),
            MissingAttribute::Ipv4 => write!(f, "failed to find IPv4 address"),
        }
    }
}

/// Main error type for tapnet operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Failed to encode output: {0}")]
    Json(#[from] serde_json::Error),

    // Factory errors
    #[error("network manager {0} not supported")]
    UnsupportedManager(String),

    // Precondition errors
    #[error("failed to find {0} interface: {0} device not found")]
    DeviceNotFound(String),

    // Capacity errors
    #[error("TAP interface index is too high: {0} (max 255)")]
    TapIndexExhausted(usize),

    // Policy errors
    #[error("unsupported operation: can't spawn multiple unikernels in the same network namespace")]
    MultipleSandboxes,

    // Parameter errors
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    // Kernel errors
    #[error("link not found: {0}")]
    LinkNotFound(String),

    #[error("{op} failed: {message}")]
    KernelOperation { op: String, message: String },

    // Introspection errors
    #[error("{0}: no such network interface")]
    NoSuchInterface(String),

    #[error("{missing} for interface {iface}")]
    Introspection {
        iface: String,
        missing: MissingAttribute,
    },
}

impl Error {
    /// Build a kernel operation error from any displayable cause
    pub fn kernel(op: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::KernelOperation {
            op: op.into(),
            message: message.to_string(),
        }
    }

    /// True when the error only says the target object is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::LinkNotFound(_) | Error::NoSuchInterface(_))
    }
}

/// Result type alias for tapnet operations
pub type Result<T> = std::result::Result<T, Error>;
