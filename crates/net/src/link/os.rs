//! Address, route and state commands for the host platform

use super::command::Cmd;
use ipnetwork::IpNetwork;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Macos,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Macos
        } else {
            Platform::Linux
        }
    }

    /// Interface argument handed to wireguard-go
    pub fn driver_interface_arg<'a>(&self, name: &'a str) -> &'a str {
        match self {
            // the kernel picks the next free utunN
            Platform::Macos => "utun",
            Platform::Linux => name,
        }
    }

    pub fn set_up(&self, iface: &str, up: bool) -> Cmd {
        let state = if up { "up" } else { "down" };
        match self {
            Platform::Linux => Cmd::new("ip").args(["link", "set", "dev", iface, state]),
            Platform::Macos => Cmd::new("ifconfig").args([iface, state]),
        }
    }

    pub fn add_addr(&self, iface: &str, addr: IpNetwork) -> Cmd {
        match self {
            Platform::Linux => Cmd::new("ip")
                .arg(family_flag(addr))
                .args(["address", "add"])
                .arg(addr.to_string())
                .args(["dev", iface]),
            Platform::Macos => {
                let cmd = Cmd::new("ifconfig").arg(iface).arg(inet(addr));
                match addr {
                    // point-to-point: the destination is the local address itself
                    IpNetwork::V4(_) => cmd
                        .arg(addr.to_string())
                        .arg(addr.ip().to_string())
                        .arg("alias"),
                    IpNetwork::V6(_) => cmd.arg(addr.to_string()).arg("alias"),
                }
            }
        }
    }

    pub fn del_addr(&self, iface: &str, addr: IpNetwork) -> Cmd {
        match self {
            Platform::Linux => Cmd::new("ip")
                .arg(family_flag(addr))
                .args(["address", "del"])
                .arg(addr.to_string())
                .args(["dev", iface]),
            Platform::Macos => Cmd::new("ifconfig")
                .arg(iface)
                .arg(inet(addr))
                .arg(addr.ip().to_string())
                .arg("-alias"),
        }
    }

    /// Route command. `ip route replace` is idempotent; on macOS an
    /// existing route needs `change` instead of `add`.
    pub fn add_route(&self, iface: &str, dest: IpNetwork) -> Cmd {
        match self {
            Platform::Linux => Cmd::new("ip")
                .arg(family_flag(dest))
                .args(["route", "replace"])
                .arg(dest.to_string())
                .args(["dev", iface]),
            Platform::Macos => bsd_route("add", iface, dest),
        }
    }

    pub fn change_route(&self, iface: &str, dest: IpNetwork) -> Option<Cmd> {
        match self {
            Platform::Linux => None,
            Platform::Macos => Some(bsd_route("change", iface, dest)),
        }
    }

    pub fn del_route(&self, iface: &str, dest: IpNetwork) -> Cmd {
        match self {
            Platform::Linux => Cmd::new("ip")
                .arg(family_flag(dest))
                .args(["route", "del"])
                .arg(dest.to_string())
                .args(["dev", iface]),
            Platform::Macos => bsd_route("delete", iface, dest),
        }
    }
}

fn family_flag(net: IpNetwork) -> &'static str {
    match net {
        IpNetwork::V4(_) => "-4",
        IpNetwork::V6(_) => "-6",
    }
}

fn inet(net: IpNetwork) -> &'static str {
    match net {
        IpNetwork::V4(_) => "inet",
        IpNetwork::V6(_) => "inet6",
    }
}

fn bsd_route(verb: &str, iface: &str, dest: IpNetwork) -> Cmd {
    let family = match dest {
        IpNetwork::V4(_) => "-inet",
        IpNetwork::V6(_) => "-inet6",
    };
    Cmd::new("route")
        .args(["-q", "-n", verb, family])
        .arg(dest.to_string())
        .args(["-interface", iface])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_linux_commands() {
        let p = Platform::Linux;
        assert_eq!(
            p.add_addr("mesh0", net("10.1.1.1/24")).to_string(),
            "ip -4 address add 10.1.1.1/24 dev mesh0"
        );
        assert_eq!(
            p.add_route("mesh0", net("10.1.0.0/24")).to_string(),
            "ip -4 route replace 10.1.0.0/24 dev mesh0"
        );
        assert_eq!(
            p.set_up("mesh0", true).to_string(),
            "ip link set dev mesh0 up"
        );
        assert!(p.change_route("mesh0", net("10.1.0.0/24")).is_none());
        assert_eq!(p.driver_interface_arg("mesh0"), "mesh0");
    }

    #[test]
    fn test_macos_commands() {
        let p = Platform::Macos;
        assert_eq!(
            p.add_addr("utun4", net("10.1.1.1/24")).to_string(),
            "ifconfig utun4 inet 10.1.1.1/24 10.1.1.1 alias"
        );
        assert_eq!(
            p.del_addr("utun4", net("10.1.1.1/24")).to_string(),
            "ifconfig utun4 inet 10.1.1.1 -alias"
        );
        assert_eq!(
            p.add_route("utun4", net("10.1.0.0/24")).to_string(),
            "route -q -n add -inet 10.1.0.0/24 -interface utun4"
        );
        assert_eq!(
            p.change_route("utun4", net("10.1.0.0/24")).unwrap().to_string(),
            "route -q -n change -inet 10.1.0.0/24 -interface utun4"
        );
        assert_eq!(p.driver_interface_arg("mesh0"), "utun");
    }
}
