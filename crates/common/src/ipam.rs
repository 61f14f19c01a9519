//! Mesh network allocation
//!
//! Every instance and every user device owns one /24 out of a shared /16.

use crate::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use std::net::Ipv4Addr;

/// Pool the per-segment networks are carved from
pub const MESH_POOL: (Ipv4Addr, u8) = (Ipv4Addr::new(10, 100, 0, 0), 16);

/// Prefix length of a single segment
pub const SEGMENT_PREFIX: u8 = 24;

/// Allocate the first free segment that overlaps none of `used`
pub fn allocate_network(used: &[IpNetwork]) -> Result<Ipv4Network> {
    let (base, prefix) = MESH_POOL;
    let pool = Ipv4Network::new(base, prefix)?;
    let segments = 1u32 << (SEGMENT_PREFIX - prefix);

    for i in 0..segments {
        let addr = Ipv4Addr::from(u32::from(pool.network()) + (i << (32 - SEGMENT_PREFIX)));
        let candidate = Ipv4Network::new(addr, SEGMENT_PREFIX)?;
        if !used.iter().any(|net| overlaps(&IpNetwork::V4(candidate), net)) {
            return Ok(candidate);
        }
    }

    Err(Error::Internal(format!(
        "no free /{} left in {}",
        SEGMENT_PREFIX, pool
    )))
}

/// Parse every string that is a valid CIDR, skipping the rest
pub fn parse_used<'a>(networks: impl IntoIterator<Item = &'a str>) -> Vec<IpNetwork> {
    networks
        .into_iter()
        .filter_map(|n| n.parse::<IpNetwork>().ok())
        .collect()
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    match (a, b) {
        (IpNetwork::V4(a), IpNetwork::V4(b)) => a.contains(b.network()) || b.contains(a.network()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_segment() {
        let net = allocate_network(&[]).unwrap();
        assert_eq!(net.to_string(), "10.100.0.0/24");
    }

    #[test]
    fn test_skips_used_segments() {
        let used = parse_used(["10.100.0.0/24", "10.100.1.5/24", "garbage"]);
        let net = allocate_network(&used).unwrap();
        assert_eq!(net.to_string(), "10.100.2.0/24");
    }

    #[test]
    fn test_wider_used_network_blocks_its_segments() {
        let used = parse_used(["10.100.0.0/23"]);
        let net = allocate_network(&used).unwrap();
        assert_eq!(net.to_string(), "10.100.2.0/24");
    }

    #[test]
    fn test_exhausted_pool() {
        let used = parse_used(["10.100.0.0/16"]);
        assert!(allocate_network(&used).is_err());
    }
}
