//! Error types for dhcpd-unnumbered.
//!
//! Request-path failures never escape a listener: they are logged and the
//! datagram is dropped. The variants here surface from kernel queries,
//! configuration validation and socket setup.

use std::io;
use thiserror::Error;

/// Result type alias for dhcpd-unnumbered operations.
pub type Result<T> = std::result::Result<T, DhcpdError>;

/// Errors that can occur in the DHCP server.
#[derive(Debug, Error)]
pub enum DhcpdError {
    /// Netlink socket operation failed.
    #[error("Netlink operation failed: {operation}: {message}")]
    Netlink {
        /// The operation that failed (e.g., "dump routes", "get link").
        operation: String,
        /// Error message.
        message: String,
    },

    /// A listener was requested for an interface that is not a VRF.
    #[error("Interface '{interface}' is not a VRF")]
    NotVrf {
        /// The interface name.
        interface: String,
    },

    /// Interface lookup failed.
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The setting that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Override options file could not be read or decoded.
    #[error("Failed to load options file {path}: {message}")]
    Options {
        /// Path of the options file.
        path: String,
        /// Error message.
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DhcpdError {
    /// Creates a netlink error.
    pub fn netlink(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Netlink {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Creates a not-a-VRF error.
    pub fn not_vrf(interface: impl Into<String>) -> Self {
        Self::NotVrf {
            interface: interface.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.to_string(),
        }
    }

    /// Creates an options file error.
    pub fn options(path: impl Into<String>, message: impl ToString) -> Self {
        Self::Options {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if the error means the interface can never host a
    /// scoped listener. Repeating the attempt will not help.
    pub fn is_not_vrf(&self) -> bool {
        matches!(self, DhcpdError::NotVrf { .. })
    }
}
