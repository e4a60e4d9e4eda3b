//! LAN peer discovery and file sharing.
//!
//! Nodes announce themselves with UDP beacons, keep a time-bounded registry
//! of the peers they hear, and serve their shared directory over a simple
//! one-request-per-connection TCP protocol.

pub mod catalog;
pub mod config;
pub mod networking;
pub mod shell;

pub use catalog::FileCatalog;
pub use config::NodeConfig;
