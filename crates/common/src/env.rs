//! Explicit runtime environment handed to every command

use crate::config::ClientConfig;
use crate::db::Database;
use crate::Result;

/// Configuration plus an open database
#[derive(Clone)]
pub struct Env {
    pub config: ClientConfig,
    pub db: Database,
}

impl Env {
    pub fn new(config: ClientConfig, db: Database) -> Self {
        Self { config, db }
    }

    /// Open the database the configuration points at
    pub fn open(config: ClientConfig) -> Result<Self> {
        let db = Database::open_existing(config.db_path())?;
        Ok(Self { config, db })
    }

    /// In-memory environment with default configuration
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            config: ClientConfig::default(),
            db: Database::open_memory()?,
        })
    }
}
