//! WireGuard device programming through `wireguard_control`.
//!
//! The kernel backend talks netlink; the userspace backend talks to the
//! driver's UAPI socket under [`CONTROL_DIR`], resolving `<name>.name` to
//! the real interface on macOS.

use super::{DeviceConfig, DeviceState, PeerConfig, PeerState};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use meshlink_common::{Error, Result, WgKey};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::debug;
use wireguard_control::{
    AllowedIp, Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder, PeerInfo,
};

/// Directory the userspace control sockets live in
pub const CONTROL_DIR: &str = "/var/run/wireguard";

/// Applies device configurations and reads device state back
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn apply(&self, name: &str, config: &DeviceConfig) -> Result<()>;

    async fn get(&self, name: &str) -> Result<DeviceState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Kernel,
    Userspace,
}

impl Flavor {
    fn backend(self) -> Result<Backend> {
        match self {
            #[cfg(target_os = "linux")]
            Flavor::Kernel => Ok(Backend::Kernel),
            #[cfg(not(target_os = "linux"))]
            Flavor::Kernel => Err(Error::InvalidConfig(format!(
                "kernel WireGuard is not available on {}",
                std::env::consts::OS
            ))),
            Flavor::Userspace => Ok(Backend::Userspace),
        }
    }
}

/// [`DeviceControl`] backed by `wireguard_control`
#[derive(Debug, Clone, Copy)]
pub struct WgControl {
    flavor: Flavor,
}

impl WgControl {
    /// Kernel devices over netlink (Linux only)
    pub fn kernel() -> Self {
        Self {
            flavor: Flavor::Kernel,
        }
    }

    /// wireguard-go devices over their UAPI socket
    pub fn userspace() -> Self {
        Self {
            flavor: Flavor::Userspace,
        }
    }
}

#[async_trait]
impl DeviceControl for WgControl {
    async fn apply(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        let iface = interface_name(name)?;
        let backend = self.flavor.backend()?;
        let update = device_update(config);
        let name = name.to_string();

        blocking(move || update.apply(&iface, backend))
            .await
            .map_err(|e| device_error(&name, e))
    }

    async fn get(&self, name: &str) -> Result<DeviceState> {
        let iface = interface_name(name)?;
        let backend = self.flavor.backend()?;
        let owned = name.to_string();

        let device = blocking(move || Device::get(&iface, backend))
            .await
            .map_err(|e| device_error(&owned, e))?;
        debug!("{} reports {} peers", name, device.peers.len());
        device_state(device)
    }
}

async fn blocking<T, F>(f: F) -> std::io::Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?
}

fn interface_name(name: &str) -> Result<InterfaceName> {
    name.parse()
        .map_err(|e| Error::InvalidConfig(format!("invalid interface name '{}': {}", name, e)))
}

fn device_error(name: &str, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound => Error::not_found("device", name),
        ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("WireGuard device {}: {}", name, e))
        }
        _ => Error::Fatal(format!("WireGuard device {}: {}", name, e)),
    }
}

fn to_key(key: &WgKey) -> Key {
    Key(*key.as_bytes())
}

fn from_key(key: &Key) -> Result<WgKey> {
    WgKey::from_slice(key.as_bytes())
}

fn keepalive_secs(interval: Duration) -> u16 {
    u16::try_from(interval.as_secs()).unwrap_or(u16::MAX)
}

fn to_network(ip: &AllowedIp) -> Result<IpNetwork> {
    Ok(IpNetwork::new(ip.address, ip.cidr)?)
}

fn peer_builder(peer: &PeerConfig) -> PeerConfigBuilder {
    let mut builder = PeerConfigBuilder::new(&to_key(&peer.public_key))
        .set_endpoint(peer.endpoint)
        .replace_allowed_ips();
    for net in &peer.allowed_ips {
        builder = builder.add_allowed_ip(net.ip(), net.prefix());
    }
    if let Some(interval) = peer.persistent_keepalive {
        builder = builder.set_persistent_keepalive_interval(keepalive_secs(interval));
    }
    builder
}

fn device_update(config: &DeviceConfig) -> DeviceUpdate {
    let mut update = DeviceUpdate::new().set_private_key(to_key(&config.private_key));
    if let Some(port) = config.listen_port {
        update = update.set_listen_port(port);
    }
    if config.replace_peers {
        update = update.replace_peers();
    }
    config
        .peers
        .iter()
        .fold(update, |update, peer| update.add_peer(peer_builder(peer)))
}

fn peer_state(info: PeerInfo) -> Result<PeerState> {
    Ok(PeerState {
        public_key: Some(from_key(&info.config.public_key)?),
        endpoint: info.config.endpoint,
        allowed_ips: info
            .config
            .allowed_ips
            .iter()
            .map(to_network)
            .collect::<Result<_>>()?,
        last_handshake: info.stats.last_handshake_time,
        rx_bytes: info.stats.rx_bytes,
        tx_bytes: info.stats.tx_bytes,
        persistent_keepalive: info
            .config
            .persistent_keepalive_interval
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs.into())),
    })
}

fn device_state(device: Device) -> Result<DeviceState> {
    Ok(DeviceState {
        private_key: device.private_key.as_ref().map(from_key).transpose()?,
        listen_port: device.listen_port.unwrap_or(0),
        peers: device
            .peers
            .into_iter()
            .map(peer_state)
            .collect::<Result<_>>()?,
    })
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records applied configurations and serves the resulting state
    #[derive(Default)]
    pub struct FakeControl {
        applied: Mutex<Vec<(String, DeviceConfig)>>,
        state: Mutex<HashMap<String, DeviceState>>,
    }

    impl FakeControl {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn applied(&self) -> Vec<(String, DeviceConfig)> {
            self.applied.lock().clone()
        }
    }

    #[async_trait]
    impl DeviceControl for FakeControl {
        async fn apply(&self, name: &str, config: &DeviceConfig) -> Result<()> {
            self.applied.lock().push((name.to_string(), config.clone()));
            let mut state = self.state.lock();
            let device = state.entry(name.to_string()).or_default();
            device.private_key = Some(config.private_key);
            if let Some(port) = config.listen_port {
                device.listen_port = port;
            }
            if config.replace_peers {
                device.peers.clear();
            }
            device.peers.extend(config.peers.iter().map(|p| PeerState {
                public_key: Some(p.public_key),
                endpoint: Some(p.endpoint),
                allowed_ips: p.allowed_ips.clone(),
                persistent_keepalive: p.persistent_keepalive,
                ..Default::default()
            }));
            Ok(())
        }

        async fn get(&self, name: &str) -> Result<DeviceState> {
            self.state
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found("device", name))
        }
    }
}
