//! Meshlink networking
//!
//! Link management for the WireGuard mesh, the peer roster derived from
//! the stored instances and the controller that starts and stops the mesh.

pub mod link;
pub mod roster;
pub mod vpn;

pub use link::{create_manager, DeviceConfig, Link, Manager, PeerConfig, Route};
pub use roster::{PeerRosterBuilder, Roster, KEEPALIVE, PEER_PORT};
pub use vpn::{VpnController, VpnStatus};
