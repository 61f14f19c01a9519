//! Instance commands

use anyhow::{anyhow, bail, Context, Result};
use clap::Subcommand;
use ipnetwork::Ipv4Network;
use meshlink_common::{ipam, Env, Instance, WgKey};
use meshlink_ssh::{AuthMethod, SshConnector, SshKey, Tunnel};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::output::{print_info, print_list, print_success, print_warning, OutputFormat, TableDisplay};

const READY_ATTEMPTS: u32 = 60;
const READY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Subcommand)]
pub enum InstanceCommands {
    /// Register an instance that joins the mesh
    Add {
        /// Instance name
        #[arg(short, long)]
        name: String,

        /// Public IP address
        #[arg(long)]
        ip: IpAddr,

        /// WireGuard public key of the instance (base64)
        #[arg(long)]
        public_key: String,

        /// Mesh network served by the instance; allocated when omitted
        #[arg(long)]
        network: Option<Ipv4Network>,

        /// Cloud the instance runs on
        #[arg(long)]
        cloud: Option<String>,

        /// File holding the hex SSH key seed; a new key is generated when omitted
        #[arg(long)]
        key_file: Option<PathBuf>,
    },

    /// List instances
    #[command(alias = "list")]
    Ls,

    /// Remove an instance
    Rm {
        /// Instance name
        name: String,
    },

    /// Expose the instance dashboard on a local port
    Tunnel {
        /// Instance name
        name: String,

        /// Remote target, as seen from the instance
        #[arg(long)]
        target: Option<String>,

        /// Wait until the dashboard answers HTTP before printing its URL
        #[arg(long)]
        wait: bool,
    },

    /// Print the instance's private SSH key
    Key {
        /// Instance name
        name: String,
    },
}

/// Instance display wrapper for serialization
#[derive(Serialize)]
pub struct InstanceDisplay {
    pub name: String,
    pub public_ip: String,
    pub network: String,
    pub cloud: String,
    pub public_key: String,
}

impl From<Instance> for InstanceDisplay {
    fn from(instance: Instance) -> Self {
        let public_key = WgKey::from_slice(&instance.public_key)
            .map(|k| k.to_base64())
            .unwrap_or_else(|_| "-".to_string());
        Self {
            name: instance.name,
            public_ip: instance.public_ip,
            network: instance.network,
            cloud: instance.cloud_name,
            public_key,
        }
    }
}

impl TableDisplay for InstanceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "PUBLIC IP", "NETWORK", "CLOUD", "PUBLIC KEY"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.public_ip.clone(),
            self.network.clone(),
            self.cloud.clone(),
            self.public_key.clone(),
        ]
    }
}

pub async fn execute(cmd: InstanceCommands, env: &Env, format: OutputFormat) -> Result<()> {
    match cmd {
        InstanceCommands::Add {
            name,
            ip,
            public_key,
            network,
            cloud,
            key_file,
        } => {
            match env.db.get_instance(&name) {
                Ok(_) => bail!("instance '{}' already exists", name),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }

            let public_key = WgKey::from_base64(&public_key).context("invalid --public-key")?;

            let (cloud_name, cloud_type, location) = match cloud {
                Some(cloud) => {
                    let cloud = env.db.get_cloud(&cloud)?;
                    (cloud.name, cloud.kind.to_string(), cloud.location)
                }
                None => Default::default(),
            };

            let network = match network {
                Some(network) => network,
                None => allocate(env)?,
            };

            let (ssh_key, generated) = match key_file {
                Some(path) => (read_key_file(&path)?, false),
                None => (SshKey::generate()?, true),
            };

            let instance = Instance {
                name,
                public_ip: ip.to_string(),
                network: network.to_string(),
                internal_ip: None,
                public_key: public_key.as_bytes().to_vec(),
                key_seed: ssh_key.seed().to_vec(),
                cloud_name,
                cloud_type,
                vm_id: String::new(),
                location,
                version: meshlink_common::VERSION.to_string(),
            };
            env.db.save_instance(&instance)?;

            print_success(&format!(
                "Instance '{}' added with network {}",
                instance.name, instance.network
            ));
            if generated {
                print_info("Install this key in the instance's authorized_keys:");
                println!("{}", ssh_key.public_openssh()?);
            }
        }

        InstanceCommands::Ls => {
            let instances: Vec<InstanceDisplay> = env
                .db
                .get_all_instances()?
                .into_iter()
                .map(InstanceDisplay::from)
                .collect();
            print_list(&instances, format);
        }

        InstanceCommands::Rm { name } => {
            env.db
                .delete_instance(&name)
                .with_context(|| format!("failed to remove instance '{}'", name))?;
            print_success(&format!("Instance '{}' removed", name));
            print_warning("Run `meshlink vpn start` to drop it from a running mesh");
        }

        InstanceCommands::Tunnel { name, target, wait } => {
            tunnel(env, &name, target, wait).await?;
        }

        InstanceCommands::Key { name } => {
            let instance = env.db.get_instance(&name)?;
            let key = SshKey::from_seed(&instance.key_seed)
                .with_context(|| format!("instance '{}' has no usable SSH key", name))?;
            print!("{}", key.private_openssh_pem()?);
        }
    }

    Ok(())
}

/// First free segment, counting the local device and every instance
fn allocate(env: &Env) -> Result<Ipv4Network> {
    let instances = env.db.get_all_instances()?;
    let mut networks: Vec<String> = instances.into_iter().map(|i| i.network).collect();
    match env.db.get_local_user() {
        Ok(user) => networks.push(user.device.network),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    let used = ipam::parse_used(networks.iter().map(String::as_str));
    Ok(ipam::allocate_network(&used)?)
}

fn read_key_file(path: &std::path::Path) -> Result<SshKey> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let seed = hex::decode(content.trim())
        .with_context(|| format!("{} does not hold a hex key seed", path.display()))?;
    Ok(SshKey::from_seed(&seed)?)
}

async fn tunnel(env: &Env, name: &str, target: Option<String>, wait: bool) -> Result<()> {
    let instance = env.db.get_instance(name)?;
    let ip: IpAddr = instance
        .public_ip
        .parse()
        .with_context(|| format!("instance '{}' has no valid public IP", name))?;
    let key = SshKey::from_seed(&instance.key_seed)
        .with_context(|| format!("instance '{}' has no usable SSH key", name))?;

    let ssh = &env.config.ssh;
    let remote = SocketAddr::new(ip, ssh.port).to_string();
    let target = target.unwrap_or_else(|| ssh.dashboard_target.clone());

    let connector = SshConnector::new(remote, ssh.user.clone(), AuthMethod::from(&key))
        .with_retry(ssh.connect_retries, Duration::from_secs(ssh.retry_delay_secs));
    let tunnel = Tunnel::with_connector(connector, &target)?;

    let port = tunnel
        .start()
        .await
        .with_context(|| format!("failed to open a tunnel to '{}'", name))?;
    let url = format!("http://127.0.0.1:{}/", port);

    let ready = if wait { wait_ready(&url).await } else { Ok(()) };
    match ready {
        Ok(()) => {
            print_success(&format!("{} on {} is available at {}", target, name, url));
            print_info("Press Ctrl-C to close the tunnel");
            tokio::signal::ctrl_c()
                .await
                .context("failed to wait for Ctrl-C")?;
        }
        Err(e) => {
            tunnel.close().await?;
            return Err(e);
        }
    }

    info!("Closing tunnel");
    tunnel.close().await?;
    Ok(())
}

/// Poll `url` until anything answers over HTTP
async fn wait_ready(url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    for attempt in 1..=READY_ATTEMPTS {
        match client.get(url).send().await {
            Ok(response) => {
                debug!("{} answered {}", url, response.status());
                return Ok(());
            }
            Err(e) => {
                debug!("{} not ready (attempt {}/{}): {}", url, attempt, READY_ATTEMPTS, e);
                tokio::time::sleep(READY_INTERVAL).await;
            }
        }
    }

    Err(anyhow!(
        "{} did not answer after {} attempts",
        url,
        READY_ATTEMPTS
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_common::{Device, DeviceKey, User};

    fn add(name: &str, network: Option<&str>, key_file: Option<PathBuf>) -> InstanceCommands {
        InstanceCommands::Add {
            name: name.to_string(),
            ip: "203.0.113.7".parse().unwrap(),
            public_key: WgKey::from_slice(&[9; 32]).unwrap().to_base64(),
            network: network.map(|n| n.parse().unwrap()),
            cloud: None,
            key_file,
        }
    }

    #[tokio::test]
    async fn test_add_allocates_around_user_network() {
        let env = Env::in_memory().unwrap();
        env.db
            .save_user(&User {
                username: "ada".to_string(),
                device: Device {
                    name: "laptop".to_string(),
                    key_seed: DeviceKey::generate().seed().to_vec(),
                    network: "10.100.0.0/24".to_string(),
                },
                ..Default::default()
            })
            .unwrap();

        execute(add("i1", None, None), &env, OutputFormat::Plain)
            .await
            .unwrap();
        execute(add("i2", None, None), &env, OutputFormat::Plain)
            .await
            .unwrap();

        assert_eq!(env.db.get_instance("i1").unwrap().network, "10.100.1.0/24");
        assert_eq!(env.db.get_instance("i2").unwrap().network, "10.100.2.0/24");
        assert!(execute(add("i1", None, None), &env, OutputFormat::Plain)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_add_with_key_file() {
        let env = Env::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed");
        std::fs::write(&path, format!("{}\n", hex::encode([5u8; 32]))).unwrap();

        execute(add("i1", Some("10.100.7.0/24"), Some(path)), &env, OutputFormat::Plain)
            .await
            .unwrap();

        let stored = env.db.get_instance("i1").unwrap();
        assert_eq!(stored.key_seed, vec![5u8; 32]);
        assert_eq!(stored.public_key, vec![9u8; 32]);
        assert_eq!(stored.network, "10.100.7.0/24");
    }

    #[tokio::test]
    async fn test_add_rejects_bad_public_key() {
        let env = Env::in_memory().unwrap();
        let cmd = InstanceCommands::Add {
            name: "i1".to_string(),
            ip: "203.0.113.7".parse().unwrap(),
            public_key: "not-a-key".to_string(),
            network: None,
            cloud: None,
            key_file: None,
        };
        assert!(execute(cmd, &env, OutputFormat::Plain).await.is_err());
        assert!(env.db.get_all_instances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_reports_unreadable_record() {
        let dir = tempfile::tempdir().unwrap();
        let env = crate::commands::testing::env_with_corrupt_row(dir.path(), "instances", "i1");

        let err = execute(add("i1", Some("10.100.7.0/24"), None), &env, OutputFormat::Plain)
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("already exists"), "{err}");
        assert!(err.to_string().contains("Serialization"), "{err}");
    }

    #[test]
    fn test_display_falls_back_on_bad_key() {
        let display = InstanceDisplay::from(Instance {
            name: "i1".to_string(),
            public_key: vec![1, 2, 3],
            ..Default::default()
        });
        assert_eq!(display.public_key, "-");
    }
}
