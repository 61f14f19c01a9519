//! Client configuration

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// VPN configuration
    pub vpn: VpnConfig,

    /// SSH configuration
    pub ssh: SshConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_path: crate::default_store_path(),
            vpn: VpnConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

/// Which link backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native on Linux, userspace everywhere else
    #[default]
    Auto,
    Native,
    Userspace,
}

/// VPN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// Name of the mesh interface
    pub interface: String,

    /// UDP port the remote instances listen on
    pub listen_port: u16,

    pub backend: BackendKind,

    pub userspace: UserspaceConfig,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            interface: "mesh0".to_string(),
            listen_port: 10999,
            backend: BackendKind::Auto,
            userspace: UserspaceConfig::default(),
        }
    }
}

/// Userspace driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserspaceConfig {
    /// Directory holding the driver's control sockets and name files
    pub run_dir: PathBuf,

    /// Path to the wireguard-go binary
    pub driver_path: String,

    /// Driver writes the real interface name itself (macOS utun)
    pub driver_publishes_name: bool,

    /// How long DelLink waits for the interface to vanish
    pub exit_timeout_secs: u64,

    pub descriptor_poll_attempts: u32,

    pub descriptor_poll_interval_ms: u64,
}

impl Default for UserspaceConfig {
    fn default() -> Self {
        let driver_path = if cfg!(target_os = "macos") {
            "/usr/local/bin/wireguard-go"
        } else {
            "wireguard-go"
        };

        Self {
            run_dir: PathBuf::from("/var/run/wireguard"),
            driver_path: driver_path.to_string(),
            driver_publishes_name: cfg!(target_os = "macos"),
            exit_timeout_secs: 5,
            descriptor_poll_attempts: 50,
            descriptor_poll_interval_ms: 100,
        }
    }
}

/// SSH configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,

    pub port: u16,

    /// Address forwarded to on the far side of a tunnel
    pub dashboard_target: String,

    pub connect_retries: u32,

    pub retry_delay_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            dashboard_target: "localhost:8080".to_string(),
            connect_retries: 20,
            retry_delay_secs: 3,
        }
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join(crate::DB_FILE)
    }
}
