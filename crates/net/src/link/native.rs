//! Kernel WireGuard links: interfaces through `ip(8)`, devices over netlink.

use super::command::{Cmd, CommandRunner};
use super::os::Platform;
use super::device::DeviceControl;
use super::{DeviceConfig, DeviceState, Link, Manager, Route};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use meshlink_common::{Error, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// One entry of `ip -j -d address show`
#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    linkinfo: Option<LinkInfo>,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

impl IpLink {
    fn is_wireguard(&self) -> bool {
        self.linkinfo
            .as_ref()
            .and_then(|l| l.info_kind.as_deref())
            == Some("wireguard")
    }

    fn addrs(&self) -> Vec<IpNetwork> {
        self.addr_info
            .iter()
            .filter_map(|a| {
                let ip: IpAddr = a.local.as_deref()?.parse().ok()?;
                IpNetwork::new(ip, a.prefixlen?).ok()
            })
            .collect()
    }
}

async fn show(runner: &dyn CommandRunner, name: &str) -> Result<Option<IpLink>> {
    let cmd = Cmd::new("ip").args(["-j", "-d", "address", "show", "dev", name]);
    let output = runner.output(&cmd).await?;

    if !output.success {
        if output.stderr.contains("does not exist") {
            return Ok(None);
        }
        error!("ip address show failed: {}", output.stderr.trim());
        return Err(Error::Fatal(format!(
            "`{}` failed: {}",
            cmd,
            output.stderr.trim()
        )));
    }

    let mut links: Vec<IpLink> = serde_json::from_str(&output.stdout)?;
    Ok(links.pop())
}

/// Native link manager
pub struct NativeManager {
    runner: Arc<dyn CommandRunner>,
    control: Arc<dyn DeviceControl>,
}

impl NativeManager {
    pub fn new(runner: Arc<dyn CommandRunner>, control: Arc<dyn DeviceControl>) -> Self {
        Self { runner, control }
    }

    fn link(&self, name: &str) -> Box<dyn Link> {
        Box::new(NativeLink {
            name: name.to_string(),
            runner: self.runner.clone(),
            control: self.control.clone(),
        })
    }
}

#[async_trait]
impl Manager for NativeManager {
    #[instrument(skip(self), fields(link = %name))]
    async fn create_link(&self, name: &str) -> Result<Box<dyn Link>> {
        if show(self.runner.as_ref(), name).await?.is_some() {
            return Err(Error::already_exists("link", name));
        }

        self.runner
            .run(&Cmd::new("ip").args(["link", "add", "dev", name, "type", "wireguard"]))
            .await?;

        info!("Created WireGuard link {}", name);
        Ok(self.link(name))
    }

    #[instrument(skip(self), fields(link = %name))]
    async fn get_link(&self, name: &str) -> Result<Box<dyn Link>> {
        match show(self.runner.as_ref(), name).await? {
            None => Err(Error::not_found("link", name)),
            Some(link) if !link.is_wireguard() => Err(Error::InvalidConfig(format!(
                "interface {} exists but is not a WireGuard device",
                name
            ))),
            Some(_) => Ok(self.link(name)),
        }
    }

    #[instrument(skip(self), fields(link = %name))]
    async fn del_link(&self, name: &str) -> Result<()> {
        self.get_link(name).await?;

        self.runner
            .run(&Cmd::new("ip").args(["link", "del", "dev", name]))
            .await?;

        info!("Deleted WireGuard link {}", name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn links(&self) -> Result<Vec<Box<dyn Link>>> {
        let out = self
            .runner
            .run(&Cmd::new("ip").args(["-j", "-d", "link", "show", "type", "wireguard"]))
            .await?;

        let found: Vec<IpLink> = if out.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&out)?
        };

        debug!("Found {} WireGuard links", found.len());
        Ok(found.iter().map(|l| self.link(&l.ifname)).collect())
    }
}

/// A kernel WireGuard interface
pub struct NativeLink {
    name: String,
    runner: Arc<dyn CommandRunner>,
    control: Arc<dyn DeviceControl>,
}

impl NativeLink {
    async fn show(&self) -> Result<IpLink> {
        show(self.runner.as_ref(), &self.name)
            .await?
            .ok_or_else(|| Error::not_found("link", &self.name))
    }
}

#[async_trait]
impl Link for NativeLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn interface(&self) -> &str {
        &self.name
    }

    async fn index(&self) -> Result<u32> {
        Ok(self.show().await?.ifindex)
    }

    async fn is_up(&self) -> Result<bool> {
        Ok(self.show().await?.flags.iter().any(|f| f == "UP"))
    }

    #[instrument(skip(self), fields(link = %self.name))]
    async fn set_up(&self, up: bool) -> Result<()> {
        self.runner
            .run(&Platform::Linux.set_up(&self.name, up))
            .await
            .map(|_| ())
    }

    async fn addrs(&self) -> Result<Vec<IpNetwork>> {
        Ok(self.show().await?.addrs())
    }

    #[instrument(skip(self), fields(link = %self.name))]
    async fn add_addr(&self, addr: IpNetwork) -> Result<()> {
        self.runner
            .run(&Platform::Linux.add_addr(&self.name, addr))
            .await?;
        info!("Bound {} to {}", addr, self.name);
        Ok(())
    }

    #[instrument(skip(self), fields(link = %self.name))]
    async fn del_addr(&self, addr: IpNetwork) -> Result<()> {
        self.runner
            .run(&Platform::Linux.del_addr(&self.name, addr))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, config), fields(link = %self.name, peers = config.peers.len()))]
    async fn configure_device(&self, config: &DeviceConfig) -> Result<()> {
        self.control.apply(&self.name, config).await?;
        info!("Configured {} with {} peers", self.name, config.peers.len());
        Ok(())
    }

    async fn device_state(&self) -> Result<DeviceState> {
        self.control.get(&self.name).await
    }

    #[instrument(skip(self), fields(link = %self.name, dest = %route.dest))]
    async fn add_route(&self, route: &Route) -> Result<()> {
        self.runner
            .run(&Platform::Linux.add_route(&self.name, route.dest))
            .await?;
        debug!("Route {} via {}", route.dest, self.name);
        Ok(())
    }

    #[instrument(skip(self), fields(link = %self.name, dest = %route.dest))]
    async fn del_route(&self, route: &Route) -> Result<()> {
        self.runner
            .run(&Platform::Linux.del_route(&self.name, route.dest))
            .await
            .map(|_| ())
    }
}
