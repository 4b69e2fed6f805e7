//! Configuration management.
//!
//! The server reads a TOML file with a `[server]` table, one `[[share]]`
//! table per exported directory, one `[[printer]]` table per exported
//! printer, and an optional `[mimemap]` table mapping lowercase extensions
//! to hex filetypes. Configuration is loaded once at startup, validated,
//! and shared read-only with every subsystem.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

// Share attribute flags.
pub const SHARE_PROTECTED: u32 = 0x01;
pub const SHARE_READONLY: u32 = 0x02;
pub const SHARE_HIDDEN: u32 = 0x04;
pub const SHARE_SUBDIR: u32 = 0x08;
pub const SHARE_CDROM: u32 = 0x10;

/// Default seconds between periodic share/printer announcements.
pub const DEFAULT_BROADCAST_INTERVAL: u64 = 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default, rename = "share")]
    pub shares: Vec<ShareConfig>,
    #[serde(default, rename = "printer")]
    pub printers: Vec<PrinterConfig>,
    /// Extension (lowercase) to hex filetype, e.g. `md = "fff"`.
    #[serde(default)]
    pub mimemap: HashMap<String, String>,
    /// Parsed form of `mimemap`, filled in by [`Config::load`].
    #[serde(skip)]
    pub mime_types: HashMap<String, u32>,
}

/// The `[server]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub log_level: String,
    /// Seconds between periodic announcements; 0 disables them.
    pub broadcast_interval: u64,
    /// Whether the authentication port is serviced.
    pub access_plus: bool,
}

/// One `[[share]]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareConfig {
    pub name: String,
    pub path: PathBuf,
    /// Any of `protected`, `readonly`, `hidden`, `subdir`, `cdrom`.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Pass-PIN source for protected shares.
    #[serde(default)]
    pub password: Option<String>,
    /// Hex filetype applied to extensionless files in this share.
    #[serde(default)]
    pub default_type: Option<String>,
}

/// One `[[printer]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub name: String,
    /// Spool directory root.
    pub path: PathBuf,
    /// Printer definition file copied into the spool root.
    pub definition: PathBuf,
    #[serde(default)]
    pub description: String,
    /// Seconds between spool scans.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Print command; `%f` is replaced with the spooled file path.
    pub command: String,
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            access_plus: true,
        }
    }
}

impl ShareConfig {
    /// Attribute names folded into the wire bitfield.
    pub fn attribute_bits(&self) -> u32 {
        let mut bits = 0;
        for attr in &self.attributes {
            bits |= match attr.to_ascii_lowercase().as_str() {
                "protected" => SHARE_PROTECTED,
                "readonly" => SHARE_READONLY,
                "hidden" => SHARE_HIDDEN,
                "subdir" => SHARE_SUBDIR,
                "cdrom" => SHARE_CDROM,
                _ => 0,
            };
        }
        bits
    }

    pub fn is_protected(&self) -> bool {
        self.attribute_bits() & SHARE_PROTECTED != 0
    }

    /// Parsed `default_type`, if present and valid hex.
    pub fn default_filetype(&self) -> Option<u32> {
        self.default_type
            .as_deref()
            .and_then(|t| u32::from_str_radix(t, 16).ok())
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content)?;
        config.mime_types = config
            .mimemap
            .iter()
            .filter_map(|(ext, ty)| {
                u32::from_str_radix(ty, 16)
                    .ok()
                    .map(|t| (ext.to_ascii_lowercase(), t & 0xFFF))
            })
            .collect();
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ServerError> {
        for (i, share) in self.shares.iter().enumerate() {
            if share.name.is_empty() {
                return Err(ServerError::Config("share with empty name".to_string()));
            }
            if share.path.as_os_str().is_empty() {
                return Err(ServerError::Config(format!(
                    "share '{}' has no path",
                    share.name
                )));
            }
            if self.shares[..i]
                .iter()
                .any(|s| s.name.eq_ignore_ascii_case(&share.name))
            {
                return Err(ServerError::Config(format!(
                    "duplicate share name '{}'",
                    share.name
                )));
            }
            if share.is_protected() && share.password.as_deref().unwrap_or("").is_empty() {
                return Err(ServerError::Config(format!(
                    "protected share '{}' has no password",
                    share.name
                )));
            }
        }
        for printer in &self.printers {
            if printer.name.is_empty() {
                return Err(ServerError::Config("printer with empty name".to_string()));
            }
            if !printer.command.contains("%f") {
                return Err(ServerError::Config(format!(
                    "printer '{}' command has no %f placeholder",
                    printer.name
                )));
            }
        }
        Ok(())
    }

    /// Finds a share by case-insensitive name.
    pub fn find_share(&self, name: &str) -> Option<&ShareConfig> {
        self.shares
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}
