//! Links backed by a `wireguard-go` process.
//!
//! The driver daemonises and keeps two files in the run directory:
//! `<name>.name` holds the real interface identifier (macOS hands out
//! `utunN`, so it differs from the requested name) and `<real>.sock` is
//! the UAPI control socket. A link is registered while its `.name` file
//! exists; removing the socket tells the driver to exit.
//!
//! The device itself is programmed through [`DeviceControl`], which finds
//! the socket under [`CONTROL_DIR`] by link name.

use super::command::{Cmd, CommandRunner};
use super::os::Platform;
use super::device::{DeviceControl, CONTROL_DIR};
use super::{iface, DeviceConfig, DeviceState, Link, Manager, Route};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use meshlink_common::{Error, Result, UserspaceConfig};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Environment variable the driver writes the real interface name to
pub const NAME_FILE_ENV: &str = "WG_TUN_NAME_FILE";

/// Userspace link manager
pub struct UserspaceManager {
    config: UserspaceConfig,
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    control: Arc<dyn DeviceControl>,
}

impl UserspaceManager {
    pub fn new(
        config: UserspaceConfig,
        platform: Platform,
        runner: Arc<dyn CommandRunner>,
        control: Arc<dyn DeviceControl>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.run_dir).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => Error::PermissionDenied(format!(
                "cannot create {}: {}",
                config.run_dir.display(),
                e
            )),
            _ => Error::Io(e),
        })?;
        if config.run_dir != Path::new(CONTROL_DIR) {
            warn!(
                "run directory {} differs from {}; device control expects sockets there",
                config.run_dir.display(),
                CONTROL_DIR
            );
        }

        Ok(Self {
            config,
            platform,
            runner,
            control,
        })
    }

    fn name_file(&self, name: &str) -> PathBuf {
        self.config.run_dir.join(format!("{}.name", name))
    }

    fn sock_file(&self, interface: &str) -> PathBuf {
        self.config.run_dir.join(format!("{}.sock", interface))
    }

    fn link(&self, name: &str, interface: String) -> UserspaceLink {
        UserspaceLink {
            name: name.to_string(),
            sock: self.sock_file(&interface),
            name_file: self.name_file(name),
            interface,
            platform: self.platform,
            runner: self.runner.clone(),
            control: self.control.clone(),
        }
    }

    /// Control sockets currently present in the run directory
    async fn sockets(&self) -> Result<HashSet<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.config.run_dir).await?;
        let mut found = HashSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "sock") {
                found.insert(path);
            }
        }
        Ok(found)
    }

    /// Remove whatever a driver left behind after a failed create.
    ///
    /// Deleting a new socket makes its driver exit. Failures are logged
    /// and otherwise ignored.
    async fn abandon(&self, name_file: &Path, before: &HashSet<PathBuf>) {
        match self.sockets().await {
            Ok(now) => {
                for sock in now.difference(before) {
                    warn!("Removing control socket {} of failed link", sock.display());
                    if let Err(e) = tokio::fs::remove_file(sock).await {
                        warn!("could not remove {}: {}", sock.display(), e);
                    }
                }
            }
            Err(e) => warn!(
                "could not scan {} for stale sockets: {}",
                self.config.run_dir.display(),
                e
            ),
        }

        match tokio::fs::remove_file(name_file).await {
            Ok(()) => debug!("Removed partial descriptor {}", name_file.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {}: {}", name_file.display(), e),
        }
    }

    /// Read the descriptor of a registered link
    async fn lookup(&self, name: &str) -> Result<UserspaceLink> {
        let path = self.name_file(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found("link", name))
            }
            Err(e) => return Err(e.into()),
        };

        let interface = content.trim();
        if interface.is_empty() {
            return Err(Error::Fatal(format!(
                "{} contains no interface name",
                path.display()
            )));
        }
        Ok(self.link(name, interface.to_string()))
    }

    /// Poll until the driver has fully written the descriptor.
    ///
    /// The file counts as complete once it is non-empty and ends in a
    /// newline.
    async fn await_descriptor(&self, path: &Path) -> Result<String> {
        let interval = Duration::from_millis(self.config.descriptor_poll_interval_ms);

        for attempt in 1..=self.config.descriptor_poll_attempts {
            match tokio::fs::read_to_string(path).await {
                Ok(content) if content.ends_with('\n') && !content.trim().is_empty() => {
                    return Ok(content.trim().to_string());
                }
                Ok(_) => debug!("descriptor {} incomplete (attempt {})", path.display(), attempt),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("descriptor {} missing (attempt {})", path.display(), attempt)
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(interval).await;
        }

        Err(Error::Fatal(format!(
            "driver did not publish an interface name in {} after {} attempts",
            path.display(),
            self.config.descriptor_poll_attempts
        )))
    }
}

#[async_trait]
impl Manager for UserspaceManager {
    #[instrument(skip(self), fields(link = %name))]
    async fn create_link(&self, name: &str) -> Result<Box<dyn Link>> {
        let name_file = self.name_file(name);
        if tokio::fs::try_exists(&name_file).await? {
            return Err(Error::already_exists("link", name));
        }

        let arg = self.platform.driver_interface_arg(name);
        let cmd = Cmd::new(&self.config.driver_path)
            .arg(arg)
            .env(NAME_FILE_ENV, name_file.to_string_lossy());
        let before = self.sockets().await?;
        self.runner.run(&cmd).await?;

        let published = if self.config.driver_publishes_name {
            self.await_descriptor(&name_file).await
        } else {
            tokio::fs::write(&name_file, format!("{}\n", arg))
                .await
                .map(|_| arg.to_string())
                .map_err(Error::from)
        };
        let interface = match published {
            Ok(interface) => interface,
            Err(e) => {
                self.abandon(&name_file, &before).await;
                return Err(match e {
                    Error::Fatal(_) => e,
                    other => Error::Fatal(format!("link {} not created: {}", name, other)),
                });
            }
        };

        info!("Created userspace link {} on {}", name, interface);
        Ok(Box::new(self.link(name, interface)))
    }

    #[instrument(skip(self), fields(link = %name))]
    async fn get_link(&self, name: &str) -> Result<Box<dyn Link>> {
        Ok(Box::new(self.lookup(name).await?))
    }

    #[instrument(skip(self), fields(link = %name))]
    async fn del_link(&self, name: &str) -> Result<()> {
        let link = self.lookup(name).await?;

        // the driver exits once its control socket disappears
        remove_file(&link.sock).await?;
        remove_file(&link.name_file).await?;

        iface::wait_gone(
            &link.interface,
            Duration::from_secs(self.config.exit_timeout_secs),
        )
        .await?;

        info!("Deleted userspace link {} ({})", name, link.interface);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn links(&self) -> Result<Vec<Box<dyn Link>>> {
        let mut entries = tokio::fs::read_dir(&self.config.run_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_string_lossy().strip_suffix(".name") {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut links: Vec<Box<dyn Link>> = Vec::with_capacity(names.len());
        for name in names {
            links.push(Box::new(self.lookup(&name).await?));
        }
        Ok(links)
    }
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("{} already removed", path.display());
            Ok(())
        }
        Err(e) => Err(Error::Fatal(format!(
            "could not remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// A link served by a wireguard-go process
pub struct UserspaceLink {
    name: String,
    interface: String,
    sock: PathBuf,
    name_file: PathBuf,
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    control: Arc<dyn DeviceControl>,
}

#[async_trait]
impl Link for UserspaceLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    async fn index(&self) -> Result<u32> {
        iface::index(&self.interface)
    }

    async fn is_up(&self) -> Result<bool> {
        iface::is_up(&self.interface)
    }

    #[instrument(skip(self), fields(link = %self.name, interface = %self.interface))]
    async fn set_up(&self, up: bool) -> Result<()> {
        self.runner
            .run(&self.platform.set_up(&self.interface, up))
            .await
            .map(|_| ())
    }

    async fn addrs(&self) -> Result<Vec<IpNetwork>> {
        iface::addrs(&self.interface)
    }

    #[instrument(skip(self), fields(link = %self.name, interface = %self.interface))]
    async fn add_addr(&self, addr: IpNetwork) -> Result<()> {
        self.runner
            .run(&self.platform.add_addr(&self.interface, addr))
            .await?;
        info!("Bound {} to {}", addr, self.interface);
        Ok(())
    }

    #[instrument(skip(self), fields(link = %self.name, interface = %self.interface))]
    async fn del_addr(&self, addr: IpNetwork) -> Result<()> {
        self.runner
            .run(&self.platform.del_addr(&self.interface, addr))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, config), fields(link = %self.name, peers = config.peers.len()))]
    async fn configure_device(&self, config: &DeviceConfig) -> Result<()> {
        self.control.apply(&self.name, config).await?;
        info!("Configured {} with {} peers", self.interface, config.peers.len());
        Ok(())
    }

    async fn device_state(&self) -> Result<DeviceState> {
        self.control.get(&self.name).await
    }

    #[instrument(skip(self), fields(link = %self.name, dest = %route.dest))]
    async fn add_route(&self, route: &Route) -> Result<()> {
        let add = self.platform.add_route(&self.interface, route.dest);
        let output = self.runner.output(&add).await?;
        if output.success {
            return Ok(());
        }

        match self.platform.change_route(&self.interface, route.dest) {
            Some(change) if output.stderr.contains("File exists") => {
                debug!("Route {} exists, changing it", route.dest);
                self.runner.run(&change).await.map(|_| ())
            }
            _ => Err(Error::Fatal(format!(
                "`{}` failed: {}",
                add,
                output.stderr.trim()
            ))),
        }
    }

    #[instrument(skip(self), fields(link = %self.name, dest = %route.dest))]
    async fn del_route(&self, route: &Route) -> Result<()> {
        self.runner
            .run(&self.platform.del_route(&self.interface, route.dest))
            .await
            .map(|_| ())
    }
}
