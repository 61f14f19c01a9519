//! Store initialisation

use anyhow::{Context, Result};
use clap::Args;
use meshlink_common::{ClientConfig, Database};
use std::path::Path;
use tracing::info;

use crate::output::print_success;

#[derive(Args)]
pub struct InitArgs {
    /// Overwrite an existing configuration file with the defaults
    #[arg(long)]
    pub reset_config: bool,
}

pub fn execute(args: InitArgs, config: &ClientConfig, config_path: &Path) -> Result<()> {
    std::fs::create_dir_all(&config.store_path).with_context(|| {
        format!("failed to create store {}", config.store_path.display())
    })?;

    let db_path = config.db_path();
    Database::init(&db_path).context("failed to initialise the store")?;
    info!("Created database {}", db_path.display());

    if args.reset_config || !config_path.exists() {
        config
            .save(config_path)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        info!("Wrote configuration {}", config_path.display());
    }

    print_success(&format!("Store initialised at {}", config.store_path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_store_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            store_path: dir.path().join("store"),
            ..Default::default()
        };
        let config_path = config.store_path.join("config.toml");

        execute(InitArgs { reset_config: false }, &config, &config_path).unwrap();
        assert!(config.db_path().exists());
        assert!(config_path.exists());

        assert!(execute(InitArgs { reset_config: false }, &config, &config_path).is_err());
    }
}
