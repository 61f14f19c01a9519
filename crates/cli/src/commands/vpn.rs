//! Mesh VPN commands

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use meshlink_common::{Env, RosterSource};
use meshlink_net::link::PeerState;
use meshlink_net::{create_manager, VpnController, VpnStatus};
use serde::Serialize;
use std::sync::Arc;

use crate::output::{print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum VpnCommands {
    /// Bring the mesh up, or converge a running one to the stored instances
    Start,

    /// Tear the mesh link down
    Stop,

    /// Show the mesh link and its peers
    Status,
}

/// Link display wrapper for serialization
#[derive(Serialize)]
pub struct LinkDisplay {
    pub link: String,
    pub interface: String,
    pub up: bool,
    pub addresses: Vec<String>,
    pub listen_port: u16,
    pub public_key: String,
    pub peers: usize,
}

impl From<&VpnStatus> for LinkDisplay {
    fn from(status: &VpnStatus) -> Self {
        Self {
            link: status.link.clone(),
            interface: status.interface.clone(),
            up: status.up,
            addresses: status.addrs.iter().map(|a| a.to_string()).collect(),
            listen_port: status.device.listen_port,
            public_key: status
                .device
                .private_key
                .as_ref()
                .map(|k| {
                    meshlink_common::DeviceKey::from_seed(k.as_bytes())
                        .map(|key| key.wireguard_public().to_base64())
                        .unwrap_or_default()
                })
                .unwrap_or_default(),
            peers: status.device.peers.len(),
        }
    }
}

impl TableDisplay for LinkDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["LINK", "INTERFACE", "UP", "ADDRESSES", "PORT", "PUBLIC KEY", "PEERS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.link.clone(),
            self.interface.clone(),
            self.up.to_string(),
            self.addresses.join(", "),
            self.listen_port.to_string(),
            self.public_key.clone(),
            self.peers.to_string(),
        ]
    }
}

/// Peer display wrapper for serialization
#[derive(Serialize)]
pub struct PeerDisplay {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: Vec<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl From<&PeerState> for PeerDisplay {
    fn from(peer: &PeerState) -> Self {
        Self {
            public_key: peer
                .public_key
                .as_ref()
                .map(|k| k.to_base64())
                .unwrap_or_else(|| "-".to_string()),
            endpoint: peer
                .endpoint
                .map(|e| e.to_string())
                .unwrap_or_else(|| "-".to_string()),
            allowed_ips: peer.allowed_ips.iter().map(|n| n.to_string()).collect(),
            last_handshake: peer.last_handshake.map(DateTime::<Utc>::from),
            rx_bytes: peer.rx_bytes,
            tx_bytes: peer.tx_bytes,
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["PUBLIC KEY", "ENDPOINT", "ALLOWED IPS", "HANDSHAKE", "RX", "TX"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.endpoint.clone(),
            self.allowed_ips.join(", "),
            handshake_age(self.last_handshake, Utc::now()),
            self.rx_bytes.to_string(),
            self.tx_bytes.to_string(),
        ]
    }
}

fn handshake_age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return "never".to_string();
    };
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

fn controller(env: &Env) -> Result<VpnController> {
    let manager = create_manager(&env.config.vpn).context("failed to set up the link backend")?;
    let roster: Arc<dyn RosterSource> = Arc::new(env.db.clone());
    Ok(VpnController::new(manager, roster, &env.config.vpn))
}

pub async fn execute(cmd: VpnCommands, env: &Env, format: OutputFormat) -> Result<()> {
    let vpn = controller(env)?;

    match cmd {
        VpnCommands::Start => {
            vpn.start().await.context("failed to start the mesh")?;
            print_success(&format!("Mesh is up on {}", vpn.interface()));
        }

        VpnCommands::Stop => {
            vpn.stop().await.context("failed to stop the mesh")?;
            print_success(&format!("Mesh link {} removed", vpn.interface()));
        }

        VpnCommands::Status => {
            let status = vpn.status().await.context("failed to read the mesh link")?;
            print_item(&LinkDisplay::from(&status), format);
            let peers: Vec<PeerDisplay> = status.device.peers.iter().map(PeerDisplay::from).collect();
            if !peers.is_empty() || format == OutputFormat::Json {
                print_list(&peers, format);
            }
        }
    }

    Ok(())
}
