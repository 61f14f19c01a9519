//! Meshlink SSH
//!
//! Sessions to instances, key material for them, and tunnels that expose
//! a remote service on a local loopback port.

pub mod forward;
pub mod keys;
pub mod session;
pub mod tunnel;

pub use forward::{forward, Connector, ForwardOutcome, ForwardSession, ForwardStream};
pub use keys::SshKey;
pub use session::{connect_with_retry, AuthMethod, SshConnector, SshSession};
pub use tunnel::Tunnel;
