//! Meshlink Common Library
//!
//! Records, persistence, key material and configuration shared by the
//! mesh client crates.

pub mod config;
pub mod crypto;
pub mod db;
pub mod env;
pub mod error;
pub mod ipam;
pub mod types;

// Re-export commonly used types
pub use config::{BackendKind, ClientConfig, SshConfig, UserspaceConfig, VpnConfig};
pub use crypto::{DeviceKey, WgKey};
pub use db::{Database, RosterSource};
pub use env::Env;
pub use error::{Error, Result};
pub use types::*;

/// Meshlink version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Database file name inside the store
pub const DB_FILE: &str = "meshlink.db";

/// Configuration file name inside the store
pub const CONFIG_FILE: &str = "config.toml";

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshlink")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join(DB_FILE)
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join(CONFIG_FILE)
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
