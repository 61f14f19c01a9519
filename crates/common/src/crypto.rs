//! Key material for the local device
//!
//! A single 32 byte seed drives both the WireGuard key pair of the
//! workstation and (in `meshlink-ssh`) the ed25519 SSH key of an instance.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of every key and seed handled here
pub const KEY_LEN: usize = 32;

/// A WireGuard key (private or public), raw 32 bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgKey([u8; KEY_LEN]);

impl WgKey {
    /// Build a key from raw bytes, rejecting anything but 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidConfig(format!(
                "invalid key length {}, expected {}",
                bytes.len(),
                KEY_LEN
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| Error::InvalidConfig(format!("invalid base64 key: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::InvalidConfig(format!("invalid hex key: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }
}

impl std::fmt::Display for WgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl std::fmt::Debug for WgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WgKey({})", self.to_base64())
    }
}

/// Key seed of the local device
#[derive(Clone)]
pub struct DeviceKey {
    seed: [u8; KEY_LEN],
}

impl DeviceKey {
    /// Generate a new random seed
    pub fn generate() -> Self {
        let mut seed = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut seed);
        Self { seed }
    }

    /// Load from a stored seed
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let seed: [u8; KEY_LEN] = seed.try_into().map_err(|_| {
            Error::InvalidConfig(format!(
                "invalid key seed length {}, expected {}",
                seed.len(),
                KEY_LEN
            ))
        })?;
        Ok(Self { seed })
    }

    pub fn seed(&self) -> &[u8; KEY_LEN] {
        &self.seed
    }

    /// WireGuard private key (clamped scalar)
    pub fn wireguard_private(&self) -> WgKey {
        let mut bytes = self.seed;
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        WgKey(bytes)
    }

    /// WireGuard public key registered with remote instances
    pub fn wireguard_public(&self) -> WgKey {
        let secret = StaticSecret::from(*self.wireguard_private().as_bytes());
        WgKey(PublicKey::from(&secret).to_bytes())
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey")
            .field("public_key", &self.wireguard_public().to_base64())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let key = DeviceKey::generate();
        let again = DeviceKey::from_seed(key.seed()).unwrap();
        assert_eq!(key.wireguard_public(), again.wireguard_public());
        assert_eq!(key.wireguard_private(), again.wireguard_private());
        assert_ne!(key.wireguard_private(), key.wireguard_public());
    }

    #[test]
    fn test_private_key_is_clamped() {
        let key = DeviceKey::from_seed(&[0xff; 32]).unwrap();
        let private = key.wireguard_private();
        assert_eq!(private.as_bytes()[0] & 7, 0);
        assert_eq!(private.as_bytes()[31] & 0x80, 0);
        assert_eq!(private.as_bytes()[31] & 0x40, 0x40);
    }

    #[test]
    fn test_rejects_short_seed() {
        assert!(DeviceKey::from_seed(&[1, 2, 3]).is_err());
        assert!(WgKey::from_slice(&[0; 31]).is_err());
    }

    #[test]
    fn test_encodings() {
        let key = DeviceKey::generate().wireguard_public();
        assert_eq!(key.to_base64().len(), 44);
        assert_eq!(WgKey::from_base64(&key.to_base64()).unwrap(), key);
        assert_eq!(WgKey::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn test_debug_hides_seed() {
        let key = DeviceKey::from_seed(&[9; 32]).unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("seed"));
    }
}
