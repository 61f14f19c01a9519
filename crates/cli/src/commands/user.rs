//! Local user commands

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use ipnetwork::Ipv4Network;
use meshlink_common::{ipam, Device, DeviceKey, Env, User};
use serde::Serialize;

use crate::output::{print_item, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create the local user and this workstation's device
    Init {
        /// Login name
        #[arg(short, long)]
        username: String,

        /// Full name
        #[arg(short, long)]
        name: String,

        /// Mesh domain
        #[arg(short, long)]
        domain: String,

        /// Device name
        #[arg(long, default_value = "workstation")]
        device: String,

        /// Device network (CIDR); allocated from the mesh pool when omitted
        #[arg(long)]
        network: Option<Ipv4Network>,
    },

    /// Show the local user
    Info,

    /// Change a field of the local user
    Set {
        #[command(subcommand)]
        field: UserField,
    },
}

#[derive(Subcommand)]
pub enum UserField {
    /// Full name
    Name { value: String },

    /// Mesh domain
    Domain { value: String },
}

/// User display wrapper for serialization
#[derive(Serialize)]
pub struct UserDisplay {
    pub username: String,
    pub name: String,
    pub domain: String,
    pub device: String,
    pub network: String,
    pub public_key: String,
}

impl UserDisplay {
    fn new(user: &User) -> Result<Self> {
        let key = DeviceKey::from_seed(&user.device.key_seed)
            .context("stored device key is corrupt")?;
        Ok(Self {
            username: user.username.clone(),
            name: user.name.clone(),
            domain: user.domain.clone(),
            device: user.device.name.clone(),
            network: user.device.network.clone(),
            public_key: key.wireguard_public().to_base64(),
        })
    }
}

impl TableDisplay for UserDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["USERNAME", "NAME", "DOMAIN", "DEVICE", "NETWORK", "PUBLIC KEY"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            self.name.clone(),
            self.domain.clone(),
            self.device.clone(),
            self.network.clone(),
            self.public_key.clone(),
        ]
    }
}

pub async fn execute(cmd: UserCommands, env: &Env, format: OutputFormat) -> Result<()> {
    match cmd {
        UserCommands::Init {
            username,
            name,
            domain,
            device,
            network,
        } => {
            match env.db.get_local_user() {
                Ok(existing) => bail!("user '{}' is already initialised", existing.username),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }

            let network = match network {
                Some(network) => network,
                None => {
                    let instances = env.db.get_all_instances()?;
                    let used = ipam::parse_used(instances.iter().map(|i| i.network.as_str()));
                    ipam::allocate_network(&used)?
                }
            };

            let key = DeviceKey::generate();
            let user = User {
                username,
                name,
                domain,
                device: Device {
                    name: device,
                    key_seed: key.seed().to_vec(),
                    network: network.to_string(),
                },
            };
            env.db.save_user(&user)?;

            print_success(&format!("User '{}' created", user.username));
            print_item(&UserDisplay::new(&user)?, format);
        }

        UserCommands::Info => {
            let user = env.db.get_local_user()?;
            print_item(&UserDisplay::new(&user)?, format);
        }

        UserCommands::Set { field } => {
            let mut user = env.db.get_local_user()?;
            let changed = match field {
                UserField::Name { value } => {
                    user.name = value;
                    "name"
                }
                UserField::Domain { value } => {
                    user.domain = value;
                    "domain"
                }
            };
            env.db.save_user(&user)?;
            print_success(&format!("User '{}' {} updated", user.username, changed));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(username: &str, network: Option<&str>) -> UserCommands {
        UserCommands::Init {
            username: username.to_string(),
            name: "Ada".to_string(),
            domain: "example.org".to_string(),
            device: "laptop".to_string(),
            network: network.map(|n| n.parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_init_allocates_network() {
        let env = Env::in_memory().unwrap();
        execute(init("ada", None), &env, OutputFormat::Plain).await.unwrap();

        let user = env.db.get_local_user().unwrap();
        assert_eq!(user.device.network, "10.100.0.0/24");
        assert_eq!(user.device.key_seed.len(), 32);
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let env = Env::in_memory().unwrap();
        execute(init("ada", Some("10.100.9.0/24")), &env, OutputFormat::Plain)
            .await
            .unwrap();
        assert!(execute(init("bob", None), &env, OutputFormat::Plain).await.is_err());
        assert_eq!(env.db.get_local_user().unwrap().username, "ada");
    }

    #[tokio::test]
    async fn test_set_name_and_domain() {
        let env = Env::in_memory().unwrap();
        let set = |field| UserCommands::Set { field };
        assert!(execute(
            set(UserField::Name {
                value: "Ada L.".to_string()
            }),
            &env,
            OutputFormat::Plain
        )
        .await
        .is_err());

        execute(init("ada", Some("10.100.9.0/24")), &env, OutputFormat::Plain)
            .await
            .unwrap();
        let seed = env.db.get_local_user().unwrap().device.key_seed;

        execute(
            set(UserField::Name {
                value: "Ada Lovelace".to_string(),
            }),
            &env,
            OutputFormat::Plain,
        )
        .await
        .unwrap();
        execute(
            set(UserField::Domain {
                value: "mesh.example.net".to_string(),
            }),
            &env,
            OutputFormat::Plain,
        )
        .await
        .unwrap();

        let user = env.db.get_local_user().unwrap();
        assert_eq!(user.username, "ada");
        assert_eq!(user.name, "Ada Lovelace");
        assert_eq!(user.domain, "mesh.example.net");
        assert_eq!(user.device.key_seed, seed);
    }
}
