//! CLI Commands

pub mod cloud;
pub mod init;
pub mod instance;
pub mod user;
pub mod vpn;

use anyhow::{Context, Result};
use meshlink_common::{ClientConfig, Env};
use std::path::{Path, PathBuf};

/// Configuration file to load.
///
/// An explicit `--config` wins; otherwise the file lives in the `--store`
/// directory when one is given, else in the default store.
pub fn resolve_config_path(config: Option<PathBuf>, store: Option<&Path>) -> PathBuf {
    match (config, store) {
        (Some(config), _) => config,
        (None, Some(store)) => store.join(meshlink_common::CONFIG_FILE),
        (None, None) => meshlink_common::default_config_path(),
    }
}

/// Open the store the configuration points at
pub fn open_env(config: ClientConfig) -> Result<Env> {
    let path = config.db_path();
    Env::open(config).with_context(|| {
        format!(
            "cannot open the store at {}; run `meshlink init` first",
            path.display()
        )
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Store whose `table` holds a row for `name` that no longer parses
    pub fn env_with_corrupt_row(dir: &Path, table: &str, name: &str) -> Env {
        let config = ClientConfig {
            store_path: dir.to_path_buf(),
            ..Default::default()
        };
        meshlink_common::Database::open(config.db_path()).unwrap();
        let conn = rusqlite::Connection::open(config.db_path()).unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} (name, spec, created_at, updated_at) VALUES (?1, '{{oops', 0, 0)",
                table
            ),
            [name],
        )
        .unwrap();
        Env::open(config).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_follows_store() {
        let store = Path::new("/srv/meshlink");
        assert_eq!(
            resolve_config_path(None, Some(store)),
            PathBuf::from("/srv/meshlink/config.toml")
        );
        assert_eq!(
            resolve_config_path(Some(PathBuf::from("/etc/meshlink.toml")), Some(store)),
            PathBuf::from("/etc/meshlink.toml")
        );
        assert_eq!(
            resolve_config_path(None, None),
            meshlink_common::default_config_path()
        );
    }
}
