//! Mesh start/stop orchestration
//!
//! `start` converges the well-known link to the stored roster: it reuses
//! an existing link, binds the device address only if missing, replaces
//! the whole peer set and installs routes with replace semantics. Route
//! installation is sequential and not rolled back.

use crate::link::{DeviceState, Link, Manager};
use crate::roster::PeerRosterBuilder;
use ipnetwork::IpNetwork;
use meshlink_common::{Error, Result, RosterSource, VpnConfig};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Snapshot of the running mesh link
#[derive(Debug, Clone)]
pub struct VpnStatus {
    pub link: String,
    pub interface: String,
    pub up: bool,
    pub addrs: Vec<IpNetwork>,
    pub device: DeviceState,
}

/// Starts and stops the mesh link
pub struct VpnController {
    manager: Arc<dyn Manager>,
    roster: Arc<dyn RosterSource>,
    interface: String,
    builder: PeerRosterBuilder,
}

impl VpnController {
    pub fn new(
        manager: Arc<dyn Manager>,
        roster: Arc<dyn RosterSource>,
        config: &VpnConfig,
    ) -> Self {
        Self {
            manager,
            roster,
            interface: config.interface.clone(),
            builder: PeerRosterBuilder::new(config.listen_port),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    #[instrument(skip(self), fields(link = %self.interface))]
    pub async fn start(&self) -> Result<()> {
        let user = self.roster.get_local_user()?;
        let address: IpNetwork = user.device.network.parse().map_err(|e| {
            Error::InvalidConfig(format!(
                "device network '{}' is not a valid CIDR: {}",
                user.device.network, e
            ))
        })?;

        // validate everything before the device is touched
        let instances = self.roster.get_all_instances()?;
        let roster = self.builder.build(&instances, &user.device.key_seed)?;

        let link = self.acquire_link().await?;

        if link.addrs().await?.contains(&address) {
            info!("{} already bound to {}", address, link.interface());
        } else {
            link.add_addr(address).await?;
        }
        link.set_up(true).await?;

        link.configure_device(&roster.device).await?;

        let total = roster.routes.len();
        for (applied, route) in roster.routes.iter().enumerate() {
            if let Err(e) = link.add_route(route).await {
                warn!("route {} failed after {}/{} routes", route.dest, applied, total);
                return Err(Error::Fatal(format!(
                    "route to {} failed after {} of {} routes were installed, \
                     mesh is partially applied; run `meshlink vpn stop` to clean up: {}",
                    route.dest, applied, total, e
                )));
            }
        }

        info!(
            "Mesh up on {} with {} peers",
            link.interface(),
            roster.device.peers.len()
        );
        Ok(())
    }

    #[instrument(skip(self), fields(link = %self.interface))]
    pub async fn stop(&self) -> Result<()> {
        self.manager.get_link(&self.interface).await?;
        self.manager.del_link(&self.interface).await?;
        info!("Mesh link {} removed", self.interface);
        Ok(())
    }

    pub async fn status(&self) -> Result<VpnStatus> {
        let link = self.manager.get_link(&self.interface).await?;
        Ok(VpnStatus {
            link: link.name().to_string(),
            interface: link.interface().to_string(),
            up: link.is_up().await?,
            addrs: link.addrs().await?,
            device: link.device_state().await?,
        })
    }

    async fn acquire_link(&self) -> Result<Box<dyn Link>> {
        match self.manager.get_link(&self.interface).await {
            Ok(link) => {
                info!("Reusing existing link {}", self.interface);
                Ok(link)
            }
            Err(e) if e.is_not_found() => self.manager.create_link(&self.interface).await,
            Err(e) => Err(e),
        }
    }
}
