//! Virtual network interfaces carrying the WireGuard mesh.
//!
//! Two backends implement the same [`Manager`]/[`Link`] contract:
//! - native: kernel WireGuard, interfaces through `ip` and devices over
//!   netlink (Linux)
//! - userspace: a `wireguard-go` process per link, configured over its
//!   UAPI control socket (macOS, or Linux without the kernel module)
//!
//! Link existence is always queried from the OS or the driver's runtime
//! directory, never cached.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use meshlink_common::{BackendKind, Result, VpnConfig, WgKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, instrument};

pub mod command;
pub mod device;
pub mod iface;
pub mod native;
pub mod os;
pub mod userspace;

pub use command::{Cmd, CommandOutput, CommandRunner, SystemRunner};
pub use device::{DeviceControl, WgControl};
pub use native::NativeManager;
pub use os::Platform;
pub use userspace::UserspaceManager;

/// A route sent over a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dest: IpNetwork,
}

/// Desired configuration of one WireGuard peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: WgKey,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpNetwork>,
    pub persistent_keepalive: Option<Duration>,
}

/// Desired configuration of the WireGuard device behind a link
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: WgKey,
    pub listen_port: Option<u16>,
    /// Drop every peer not listed in `peers`
    pub replace_peers: bool,
    pub peers: Vec<PeerConfig>,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("listen_port", &self.listen_port)
            .field("replace_peers", &self.replace_peers)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

/// Live state of one peer as reported by the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerState {
    pub public_key: Option<WgKey>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNetwork>,
    pub last_handshake: Option<SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub persistent_keepalive: Option<Duration>,
}

/// Live state of a WireGuard device
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub private_key: Option<WgKey>,
    pub listen_port: u16,
    pub peers: Vec<PeerState>,
}

impl std::fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceState")
            .field("has_private_key", &self.private_key.is_some())
            .field("listen_port", &self.listen_port)
            .field("peers", &self.peers)
            .finish()
    }
}

/// A virtual network interface plus its WireGuard device.
#[async_trait]
pub trait Link: Send + Sync {
    /// Name the link was created under
    fn name(&self) -> &str;

    /// Real OS interface identifier (differs from `name` for utun devices)
    fn interface(&self) -> &str;

    async fn index(&self) -> Result<u32>;

    async fn is_up(&self) -> Result<bool>;

    async fn set_up(&self, up: bool) -> Result<()>;

    /// Addresses currently bound to the interface
    async fn addrs(&self) -> Result<Vec<IpNetwork>>;

    async fn add_addr(&self, addr: IpNetwork) -> Result<()>;

    async fn del_addr(&self, addr: IpNetwork) -> Result<()>;

    /// Apply a device configuration
    async fn configure_device(&self, config: &DeviceConfig) -> Result<()>;

    async fn device_state(&self) -> Result<DeviceState>;

    /// Install a route, replacing an existing one to the same destination
    async fn add_route(&self, route: &Route) -> Result<()>;

    async fn del_route(&self, route: &Route) -> Result<()>;
}

/// Lifecycle of the links owned by a backend.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Create a link. Fails with `AlreadyExists` if one of that name is present.
    async fn create_link(&self, name: &str) -> Result<Box<dyn Link>>;

    /// Look up a link. Fails with `NotFound` if absent.
    async fn get_link(&self, name: &str) -> Result<Box<dyn Link>>;

    /// Delete a link. Fails with `NotFound` if absent.
    async fn del_link(&self, name: &str) -> Result<()>;

    /// Every link owned by this backend
    async fn links(&self) -> Result<Vec<Box<dyn Link>>>;
}

/// Create the link manager selected by the configuration.
///
/// `auto` picks the native backend on Linux and the userspace backend
/// everywhere else.
#[instrument(skip(config), fields(backend = ?config.backend))]
pub fn create_manager(config: &VpnConfig) -> Result<Arc<dyn Manager>> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    let backend = match config.backend {
        BackendKind::Auto if cfg!(target_os = "linux") => BackendKind::Native,
        BackendKind::Auto => BackendKind::Userspace,
        other => other,
    };

    match backend {
        BackendKind::Native => {
            if !cfg!(target_os = "linux") {
                return Err(meshlink_common::Error::InvalidConfig(format!(
                    "native WireGuard backend is not available on {}",
                    std::env::consts::OS
                )));
            }
            info!("Creating native link manager");
            Ok(Arc::new(NativeManager::new(
                runner,
                Arc::new(WgControl::kernel()),
            )))
        }
        _ => {
            info!(
                "Creating userspace link manager in {:?}",
                config.userspace.run_dir
            );
            Ok(Arc::new(UserspaceManager::new(
                config.userspace.clone(),
                Platform::current(),
                runner,
                Arc::new(WgControl::userspace()),
            )?))
        }
    }
}
