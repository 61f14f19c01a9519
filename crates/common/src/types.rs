//! Persisted record types
//!
//! These are the records the rest of the client reads from the local
//! database. The VPN core only ever reads them.

use serde::{Deserialize, Serialize};

/// A remote instance that takes part in the mesh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub public_ip: String,
    /// CIDR of the mesh segment served by this instance
    pub network: String,
    /// Address of the instance inside its own segment
    #[serde(default)]
    pub internal_ip: Option<String>,
    /// Raw WireGuard public key reported by the instance
    #[serde(with = "hex_bytes", default)]
    pub public_key: Vec<u8>,
    /// Seed of the SSH key installed on the instance at deploy time
    #[serde(with = "hex_bytes", default)]
    pub key_seed: Vec<u8>,
    #[serde(default)]
    pub cloud_name: String,
    #[serde(default)]
    pub cloud_type: String,
    #[serde(default)]
    pub vm_id: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub version: String,
}

/// A device belonging to the local user, i.e. this workstation
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(with = "hex_bytes")]
    pub key_seed: Vec<u8>,
    /// CIDR assigned to this workstation
    pub network: String,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

/// The local user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub name: String,
    pub domain: String,
    pub device: Device,
}

/// A cloud provider account known to the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cloud {
    pub name: String,
    pub kind: CloudKind,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub credentials: std::collections::BTreeMap<String, String>,
}

/// Supported cloud provider kinds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudKind {
    #[default]
    Scaleway,
    DigitalOcean,
    Hyperkit,
}

impl std::fmt::Display for CloudKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudKind::Scaleway => write!(f, "scaleway"),
            CloudKind::DigitalOcean => write!(f, "digitalocean"),
            CloudKind::Hyperkit => write!(f, "hyperkit"),
        }
    }
}

impl std::str::FromStr for CloudKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "scaleway" => Ok(CloudKind::Scaleway),
            "digitalocean" | "digital_ocean" => Ok(CloudKind::DigitalOcean),
            "hyperkit" => Ok(CloudKind::Hyperkit),
            other => Err(crate::Error::InvalidConfig(format!(
                "cloud '{}' not supported",
                other
            ))),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
