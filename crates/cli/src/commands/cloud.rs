//! Cloud account commands

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use meshlink_common::{Cloud, CloudKind, Env};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::output::{print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum CloudCommands {
    /// Register a cloud account
    Add {
        /// Cloud name
        #[arg(short, long)]
        name: String,

        /// Provider (scaleway, digitalocean, hyperkit)
        #[arg(short, long)]
        kind: CloudKind,

        /// Default location for new instances
        #[arg(short, long, default_value = "")]
        location: String,

        /// Provider credential as KEY=VALUE (repeatable)
        #[arg(long = "credential", value_parser = parse_credential)]
        credentials: Vec<(String, String)>,
    },

    /// List cloud accounts
    #[command(alias = "list")]
    Ls,

    /// Remove a cloud account
    Rm {
        /// Cloud name
        name: String,
    },
}

fn parse_credential(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty credential name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Cloud display wrapper, credentials are listed by name only
#[derive(Serialize)]
pub struct CloudDisplay {
    pub name: String,
    pub kind: String,
    pub location: String,
    pub credentials: Vec<String>,
}

impl From<Cloud> for CloudDisplay {
    fn from(cloud: Cloud) -> Self {
        Self {
            name: cloud.name,
            kind: cloud.kind.to_string(),
            location: cloud.location,
            credentials: cloud.credentials.into_keys().collect(),
        }
    }
}

impl TableDisplay for CloudDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "KIND", "LOCATION", "CREDENTIALS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.kind.clone(),
            self.location.clone(),
            self.credentials.join(", "),
        ]
    }
}

pub async fn execute(cmd: CloudCommands, env: &Env, format: OutputFormat) -> Result<()> {
    match cmd {
        CloudCommands::Add {
            name,
            kind,
            location,
            credentials,
        } => {
            match env.db.get_cloud(&name) {
                Ok(_) => bail!("cloud '{}' already exists", name),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            let cloud = Cloud {
                name,
                kind,
                location,
                credentials: credentials.into_iter().collect::<BTreeMap<_, _>>(),
            };
            env.db.save_cloud(&cloud)?;
            print_success(&format!("Cloud '{}' added", cloud.name));
        }

        CloudCommands::Ls => {
            let clouds: Vec<CloudDisplay> = env
                .db
                .get_all_clouds()?
                .into_iter()
                .map(CloudDisplay::from)
                .collect();
            print_list(&clouds, format);
        }

        CloudCommands::Rm { name } => {
            let instances = env.db.get_all_instances()?;
            if let Some(instance) = instances.iter().find(|i| i.cloud_name == name) {
                bail!(
                    "cloud '{}' still has instance '{}'; remove it first",
                    name,
                    instance.name
                );
            }
            env.db
                .delete_cloud(&name)
                .with_context(|| format!("failed to remove cloud '{}'", name))?;
            print_success(&format!("Cloud '{}' removed", name));
        }
    }

    Ok(())
}
