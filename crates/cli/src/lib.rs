//! Meshlink CLI
//!
//! Command-line interface for the local store, the mesh VPN and
//! instance tunnels.

pub mod commands;
pub mod output;
