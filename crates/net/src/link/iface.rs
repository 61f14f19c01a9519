//! Interface queries answered by the OS directly

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use meshlink_common::{Error, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::{if_nametoindex, InterfaceFlags};
use std::net::{SocketAddrV4, SocketAddrV6};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const GONE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn index(name: &str) -> Result<u32> {
    if_nametoindex(name).map_err(|_| Error::not_found("interface", name))
}

pub fn exists(name: &str) -> bool {
    index(name).is_ok()
}

pub fn is_up(name: &str) -> Result<bool> {
    let mut found = false;
    for ifa in getifaddrs().map_err(os_error)? {
        if ifa.interface_name == name {
            found = true;
            if ifa.flags.contains(InterfaceFlags::IFF_UP) {
                return Ok(true);
            }
        }
    }
    if found {
        Ok(false)
    } else {
        Err(Error::not_found("interface", name))
    }
}

/// IPv4 and IPv6 addresses bound to the interface, with prefix length
pub fn addrs(name: &str) -> Result<Vec<IpNetwork>> {
    let mut out = Vec::new();

    for ifa in getifaddrs().map_err(os_error)? {
        if ifa.interface_name != name {
            continue;
        }
        let (Some(addr), Some(mask)) = (ifa.address, ifa.netmask) else {
            continue;
        };

        if let (Some(a), Some(m)) = (addr.as_sockaddr_in(), mask.as_sockaddr_in()) {
            let ip = *SocketAddrV4::from(*a).ip();
            let prefix = ipnetwork::ipv4_mask_to_prefix(*SocketAddrV4::from(*m).ip())?;
            out.push(IpNetwork::V4(Ipv4Network::new(ip, prefix)?));
        } else if let (Some(a), Some(m)) = (addr.as_sockaddr_in6(), mask.as_sockaddr_in6()) {
            let ip = *SocketAddrV6::from(*a).ip();
            let prefix = ipnetwork::ipv6_mask_to_prefix(*SocketAddrV6::from(*m).ip())?;
            out.push(IpNetwork::V6(Ipv6Network::new(ip, prefix)?));
        }
    }

    Ok(out)
}

/// Wait until the interface disappears, `Fatal` once `timeout` elapses
pub async fn wait_gone(name: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;

    while exists(name) {
        if Instant::now() >= deadline {
            return Err(Error::Fatal(format!(
                "interface {} still present {}s after its driver was signalled to exit",
                name,
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(GONE_POLL_INTERVAL).await;
    }

    debug!("interface {} is gone", name);
    Ok(())
}

fn os_error(e: nix::Error) -> Error {
    Error::Fatal(format!("failed to query interfaces: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSING: &str = "mlnx-missing0";

    #[test]
    fn test_missing_interface() {
        assert!(!exists(MISSING));
        assert!(index(MISSING).unwrap_err().is_not_found());
        assert!(is_up(MISSING).unwrap_err().is_not_found());
        assert!(addrs(MISSING).unwrap().is_empty());
    }

    #[test]
    fn test_loopback() {
        let lo = if cfg!(target_os = "macos") { "lo0" } else { "lo" };
        assert!(index(lo).unwrap() > 0);
        assert!(is_up(lo).unwrap());
        assert!(addrs(lo)
            .unwrap()
            .iter()
            .any(|a| a.ip().is_loopback()));
    }

    #[tokio::test]
    async fn test_wait_gone() {
        wait_gone(MISSING, Duration::from_millis(10)).await.unwrap();

        let lo = if cfg!(target_os = "macos") { "lo0" } else { "lo" };
        let err = wait_gone(lo, Duration::from_millis(120)).await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }
}
