//! Error types for the server.
//!
//! Host-side failures (I/O, configuration, socket setup) are represented by
//! [`ServerError`]. Protocol-level failures never surface here; they are
//! reported to the client as `E` frames carrying an errno-style code and the
//! main loop keeps running.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can take the server down or abort startup.
#[derive(Debug, Error)]
pub enum ServerError {
    /// An I/O error occurred during file or socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse the TOML configuration file.
    #[error("configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("cannot read configuration {path}: {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    /// The configuration is structurally valid but semantically wrong.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// One of the well-known UDP ports could not be bound.
    #[error("cannot bind {role} socket on port {port}: {source}")]
    Bind {
        role: &'static str,
        port: u16,
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: ServerError = io_error.into();
        match err {
            ServerError::Io(_) => {}
            other => panic!("expected Io variant, got {other:?}"),
        }
    }

    #[test]
    fn config_error_message() {
        let err = ServerError::Config("share name clash".to_string());
        assert!(err.to_string().contains("share name clash"));
    }

    #[test]
    fn bind_error_names_port() {
        let err = ServerError::Bind {
            role: "rpc",
            port: 49171,
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let text = err.to_string();
        assert!(text.contains("rpc"));
        assert!(text.contains("49171"));
    }
}
