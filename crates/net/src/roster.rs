//! Peer and route set derived from the instance roster

use crate::link::{DeviceConfig, PeerConfig, Route};
use ipnetwork::IpNetwork;
use meshlink_common::{DeviceKey, Error, Instance, Result, WgKey};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// Keep-alive applied to every peer
pub const KEEPALIVE: Duration = Duration::from_secs(25);

/// Default UDP port instances accept WireGuard traffic on
pub const PEER_PORT: u16 = 10999;

/// Device configuration plus the routes that go with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub device: DeviceConfig,
    pub routes: Vec<Route>,
}

/// Turns instances into WireGuard peers, one peer and one route each.
///
/// Building is all or nothing: the first malformed entry fails the whole
/// roster.
#[derive(Debug, Clone, Copy)]
pub struct PeerRosterBuilder {
    endpoint_port: u16,
}

impl Default for PeerRosterBuilder {
    fn default() -> Self {
        Self::new(PEER_PORT)
    }
}

impl PeerRosterBuilder {
    pub fn new(endpoint_port: u16) -> Self {
        Self { endpoint_port }
    }

    pub fn build(&self, instances: &[Instance], key_seed: &[u8]) -> Result<Roster> {
        let key = DeviceKey::from_seed(key_seed)?;

        let mut peers = Vec::with_capacity(instances.len());
        let mut routes = Vec::with_capacity(instances.len());

        for instance in instances {
            let peer = self.peer(instance)?;
            routes.extend(peer.allowed_ips.iter().map(|&dest| Route { dest }));
            peers.push(peer);
        }

        debug!("Built roster with {} peers", peers.len());
        Ok(Roster {
            device: DeviceConfig {
                private_key: key.wireguard_private(),
                listen_port: None,
                replace_peers: true,
                peers,
            },
            routes,
        })
    }

    fn peer(&self, instance: &Instance) -> Result<PeerConfig> {
        let parsed: IpNetwork = instance.network.parse().map_err(|e| {
            Error::roster(
                &instance.name,
                format!("invalid network '{}': {}", instance.network, e),
            )
        })?;
        let network = IpNetwork::new(parsed.network(), parsed.prefix())?;

        let ip: IpAddr = instance.public_ip.parse().map_err(|_| {
            Error::roster(
                &instance.name,
                format!("invalid public IP '{}'", instance.public_ip),
            )
        })?;

        let public_key = WgKey::from_slice(&instance.public_key).map_err(|_| {
            Error::roster(
                &instance.name,
                format!(
                    "public key is {} bytes, expected {}",
                    instance.public_key.len(),
                    meshlink_common::crypto::KEY_LEN
                ),
            )
        })?;

        Ok(PeerConfig {
            public_key,
            endpoint: SocketAddr::new(ip, self.endpoint_port),
            allowed_ips: vec![network],
            persistent_keepalive: Some(KEEPALIVE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, ip: &str, network: &str) -> Instance {
        Instance {
            name: name.to_string(),
            public_ip: ip.to_string(),
            network: network.to_string(),
            public_key: vec![7; 32],
            ..Default::default()
        }
    }

    #[test]
    fn test_one_peer_and_route_per_instance() {
        let instances = vec![
            instance("i1", "203.0.113.5", "10.1.0.0/24"),
            instance("i2", "198.51.100.7", "10.1.2.0/24"),
        ];
        let roster = PeerRosterBuilder::default()
            .build(&instances, &[1; 32])
            .unwrap();

        assert_eq!(roster.device.peers.len(), 2);
        assert_eq!(roster.routes.len(), 2);
        assert!(roster.device.replace_peers);

        let first = &roster.device.peers[0];
        assert_eq!(first.endpoint, "203.0.113.5:10999".parse().unwrap());
        assert_eq!(first.allowed_ips, vec![roster.routes[0].dest]);
        assert_eq!(first.persistent_keepalive, Some(KEEPALIVE));
        assert_eq!(roster.routes[1].dest.to_string(), "10.1.2.0/24");
        assert_eq!(
            roster.device.private_key,
            DeviceKey::from_seed(&[1; 32]).unwrap().wireguard_private()
        );
    }

    #[test]
    fn test_network_is_masked() {
        let roster = PeerRosterBuilder::default()
            .build(&[instance("i1", "203.0.113.5", "10.1.0.9/24")], &[1; 32])
            .unwrap();
        assert_eq!(roster.routes[0].dest.to_string(), "10.1.0.0/24");
    }

    #[test]
    fn test_bad_network_fails_whole_roster() {
        let instances = vec![
            instance("i1", "203.0.113.5", "10.0.0.0/24"),
            instance("i2", "203.0.113.6", "not-a-cidr"),
        ];
        let err = PeerRosterBuilder::default()
            .build(&instances, &[1; 32])
            .unwrap_err();
        match err {
            Error::InvalidRosterEntry { name, .. } => assert_eq!(name, "i2"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_ip_and_key() {
        let builder = PeerRosterBuilder::default();
        assert!(builder
            .build(&[instance("i1", "203.0.113", "10.0.0.0/24")], &[1; 32])
            .is_err());

        let mut short_key = instance("i1", "203.0.113.5", "10.0.0.0/24");
        short_key.public_key = vec![1; 16];
        let err = builder.build(&[short_key], &[1; 32]).unwrap_err();
        assert!(err.to_string().contains("16 bytes"));
    }

    #[test]
    fn test_bad_seed() {
        let err = PeerRosterBuilder::default().build(&[], &[1; 4]).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_custom_port() {
        let roster = PeerRosterBuilder::new(51820)
            .build(&[instance("i1", "203.0.113.5", "10.1.0.0/24")], &[1; 32])
            .unwrap();
        assert_eq!(roster.device.peers[0].endpoint.port(), 51820);
    }
}
