//! Error types for the vendor node.

use std::time::Duration;
use thiserror::Error;
use vendor_protocol::{ProtocolError, SerialNumber};

/// Negative errno-style codes reported to the host.
pub mod errno {
    /// No such entry.
    pub const ENOENT: i16 = 2;
    /// I/O failure.
    pub const EIO: i16 = 5;
    /// Try again later.
    pub const EAGAIN: i16 = 11;
    /// Invalid argument.
    pub const EINVAL: i16 = 22;
    /// Malformed message.
    pub const EBADMSG: i16 = 77;
    /// Timed out.
    pub const ETIMEDOUT: i16 = 116;
    /// Message too large.
    pub const EMSGSIZE: i16 = 122;
    /// Not supported.
    pub const ENOTSUP: i16 = 134;
}

/// Errors returned by the client, server, directory and node runtime.
#[derive(Debug, Error)]
pub enum VendorError {
    /// Payload exceeds the protocol limit. Raised before any I/O.
    #[error("payload too large: maximum {max} bytes, got {actual}")]
    Size {
        /// Maximum allowed length.
        max: usize,
        /// Actual length.
        actual: usize,
    },

    /// Missing or unrecognized argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed inbound or outbound frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No matching reply arrived before the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The mesh transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The node cannot perform the operation yet.
    #[error("node not ready: {0}")]
    NotReady(String),

    /// No directory entry for the serial number.
    #[error("node {0} not found in directory")]
    NotFound(SerialNumber),

    /// Persisted settings could not be read or written.
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl VendorError {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        VendorError::InvalidArgument(message.into())
    }

    /// Create a not ready error.
    pub fn not_ready(message: impl Into<String>) -> Self {
        VendorError::NotReady(message.into())
    }

    /// Map onto a negative errno-style code.
    pub fn code(&self) -> i16 {
        let code = match self {
            VendorError::Size { .. } => errno::EMSGSIZE,
            VendorError::InvalidArgument(_) | VendorError::Config(_) => errno::EINVAL,
            VendorError::Protocol(ProtocolError::UnknownHostCommand(_)) => errno::ENOTSUP,
            VendorError::Protocol(ProtocolError::UnknownGetKind(_)) => errno::EINVAL,
            VendorError::Protocol(_) => errno::EBADMSG,
            VendorError::Timeout(_) => errno::ETIMEDOUT,
            VendorError::Transport(_) | VendorError::Settings(_) => errno::EIO,
            VendorError::NotReady(_) => errno::EAGAIN,
            VendorError::NotFound(_) => errno::ENOENT,
        };
        -code
    }
}

/// Errors from the mesh transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The node has not joined a mesh network.
    #[error("node is not provisioned")]
    NotProvisioned,

    /// The local endpoint is no longer attached to the mesh.
    #[error("endpoint {0:#06X} is detached")]
    Detached(u16),

    /// Any other delivery failure.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Errors from the persisted settings store.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// I/O error reading or writing the settings file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored value could not be decoded.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue {
        /// Settings key.
        key: String,
        /// What was wrong.
        reason: String,
    },
}

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A field has an unusable value.
    #[error("invalid '{field}': {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },
}

impl ConfigError {
    /// Create an invalid field error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
