//! SQLite database for client state persistence
//!
//! Records are stored as JSON documents keyed by name, one table per
//! record type.

use crate::types::{Cloud, Instance, User};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const CLOUDS: &str = "clouds";
const INSTANCES: &str = "instances";
const USERS: &str = "users";

/// Read access the VPN core needs from persistence
pub trait RosterSource: Send + Sync {
    /// Every known instance, in creation order
    fn get_all_instances(&self) -> Result<Vec<Instance>>;

    /// The single local user
    fn get_local_user(&self) -> Result<User>;
}

/// Database wrapper for state persistence
#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Create a fresh database, refusing to touch an existing file
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(Error::already_exists("database", path.display().to_string()));
        }
        Self::open(path)
    }

    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path);
        Ok(db)
    }

    /// Open an existing database, failing if it was never initialised
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::not_found("database", path.display().to_string()));
        }
        Self::open(path)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        for table in [CLOUDS, INSTANCES, USERS] {
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    name TEXT PRIMARY KEY,
                    spec TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#
            ))?;
        }

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Generic record operations
    // ========================================================================

    fn upsert<S: Serialize>(&self, table: &str, name: &str, spec: &S) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            &format!(
                "INSERT INTO {} (name, spec, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(name) DO UPDATE SET spec = excluded.spec, updated_at = excluded.updated_at",
                table
            ),
            params![name, serde_json::to_string(spec)?, now],
        )?;

        debug!("Saved {} '{}'", table, name);
        Ok(())
    }

    fn get<S: DeserializeOwned>(&self, table: &str, name: &str) -> Result<Option<S>> {
        let conn = self.conn.lock();

        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT spec FROM {} WHERE name = ?1", table),
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn list<S: DeserializeOwned>(&self, table: &str) -> Result<Vec<S>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT spec FROM {} ORDER BY created_at ASC, rowid ASC",
            table
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(serde_json::from_str(&row?)?);
        }
        Ok(results)
    }

    fn delete(&self, table: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!("DELETE FROM {} WHERE name = ?1", table),
            params![name],
        )?;

        if rows > 0 {
            debug!("Deleted {} '{}'", table, name);
        }
        Ok(rows > 0)
    }

    // ========================================================================
    // Clouds
    // ========================================================================

    pub fn save_cloud(&self, cloud: &Cloud) -> Result<()> {
        self.upsert(CLOUDS, &cloud.name, cloud)
    }

    pub fn get_cloud(&self, name: &str) -> Result<Cloud> {
        self.get(CLOUDS, name)?
            .ok_or_else(|| Error::not_found("cloud", name))
    }

    pub fn get_all_clouds(&self) -> Result<Vec<Cloud>> {
        self.list(CLOUDS)
    }

    pub fn delete_cloud(&self, name: &str) -> Result<()> {
        if !self.delete(CLOUDS, name)? {
            return Err(Error::not_found("cloud", name));
        }
        Ok(())
    }

    // ========================================================================
    // Instances
    // ========================================================================

    pub fn save_instance(&self, instance: &Instance) -> Result<()> {
        self.upsert(INSTANCES, &instance.name, instance)
    }

    pub fn get_instance(&self, name: &str) -> Result<Instance> {
        self.get(INSTANCES, name)?
            .ok_or_else(|| Error::not_found("instance", name))
    }

    pub fn get_all_instances(&self) -> Result<Vec<Instance>> {
        self.list(INSTANCES)
    }

    pub fn delete_instance(&self, name: &str) -> Result<()> {
        if !self.delete(INSTANCES, name)? {
            return Err(Error::not_found("instance", name));
        }
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub fn save_user(&self, user: &User) -> Result<()> {
        self.upsert(USERS, &user.username, user)
    }

    /// The local user. Exactly one may exist.
    pub fn get_local_user(&self) -> Result<User> {
        let mut users: Vec<User> = self.list(USERS)?;
        match users.len() {
            0 => Err(Error::not_found("user", "local")),
            1 => Ok(users.remove(0)),
            n => Err(Error::Internal(format!(
                "found {} users, expected exactly one; remove the database and run init again",
                n
            ))),
        }
    }
}

impl RosterSource for Database {
    fn get_all_instances(&self) -> Result<Vec<Instance>> {
        Database::get_all_instances(self)
    }

    fn get_local_user(&self) -> Result<User> {
        Database::get_local_user(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloudKind, Device};

    fn instance(name: &str, network: &str) -> Instance {
        Instance {
            name: name.to_string(),
            public_ip: "203.0.113.5".to_string(),
            network: network.to_string(),
            public_key: vec![1; 32],
            ..Default::default()
        }
    }

    #[test]
    fn test_instance_crud() {
        let db = Database::open_memory().unwrap();

        db.save_instance(&instance("i1", "10.100.0.0/24")).unwrap();
        db.save_instance(&instance("i2", "10.100.1.0/24")).unwrap();

        let got = db.get_instance("i1").unwrap();
        assert_eq!(got.network, "10.100.0.0/24");
        assert_eq!(got.public_key, vec![1; 32]);

        let all = db.get_all_instances().unwrap();
        let names: Vec<_> = all.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["i1", "i2"]);

        db.delete_instance("i1").unwrap();
        assert!(db.get_instance("i1").unwrap_err().is_not_found());
        assert!(db.delete_instance("i1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_save_instance_updates_in_place() {
        let db = Database::open_memory().unwrap();
        db.save_instance(&instance("i1", "10.100.0.0/24")).unwrap();
        db.save_instance(&instance("i1", "10.100.7.0/24")).unwrap();

        let all = db.get_all_instances().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].network, "10.100.7.0/24");
    }

    #[test]
    fn test_local_user() {
        let db = Database::open_memory().unwrap();
        assert!(db.get_local_user().unwrap_err().is_not_found());

        let user = User {
            username: "alice".to_string(),
            name: "Alice".to_string(),
            domain: "example.org".to_string(),
            device: Device {
                name: "laptop".to_string(),
                key_seed: vec![3; 32],
                network: "10.100.1.0/24".to_string(),
            },
        };
        db.save_user(&user).unwrap();
        assert_eq!(db.get_local_user().unwrap(), user);

        let mut other = user.clone();
        other.username = "bob".to_string();
        db.save_user(&other).unwrap();
        assert!(matches!(db.get_local_user(), Err(Error::Internal(_))));
    }

    #[test]
    fn test_clouds() {
        let db = Database::open_memory().unwrap();
        let cloud = Cloud {
            name: "scw".to_string(),
            kind: CloudKind::Scaleway,
            location: "fr-par-1".to_string(),
            ..Default::default()
        };
        db.save_cloud(&cloud).unwrap();
        assert_eq!(db.get_cloud("scw").unwrap(), cloud);
        assert_eq!(db.get_all_clouds().unwrap().len(), 1);
        db.delete_cloud("scw").unwrap();
        assert!(db.get_cloud("scw").is_err());
    }

    #[test]
    fn test_init_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("meshlink.db");

        Database::init(&path).unwrap();
        assert!(Database::init(&path).unwrap_err().is_already_exists());
        assert!(Database::open_existing(&path).is_ok());
        assert!(Database::open_existing(dir.path().join("missing.db"))
            .unwrap_err()
            .is_not_found());
    }
}
