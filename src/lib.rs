//! rasd - a ShareFS/Freeway server for RISC OS clients.
//!
//! rasd exposes host directories and printers to Acorn/RISC OS machines
//! over the classic UDP discovery and file-sharing protocol family. Clients
//! find the server through periodic broadcasts, unlock protected shares
//! with a pass-PIN, and drive file operations over a compact binary RPC
//! protocol.
//!
//! # Example
//!
//! ```no_run
//! use rasd::{Config, Server};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), rasd::ServerError> {
//! let config = Arc::new(Config::load(Path::new("rasd.toml"))?);
//! let server = Server::bind(config, None)?;
//! server.run().await
//! # }
//! ```

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod handle;
pub mod hostfs;
pub mod ops;
pub mod path;
pub mod printer;
pub mod riscos;
pub mod server;
pub mod transfer;
pub mod wire;

pub use config::Config;
pub use error::ServerError;
pub use server::{Ports, Server};
