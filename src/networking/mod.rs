pub mod client;
pub mod discovery;
pub mod file_transfer;
pub mod interface;
pub mod peers;
pub mod protocol;

// Re-export key components for easier access
pub use client::{TransferClient, TransferError};
pub use discovery::{DiscoveryConfig, PeerDiscovery};
pub use file_transfer::{TransferConfig, TransferServer};
pub use interface::LocalAddresses;
pub use peers::PeerRegistry;
pub use protocol::{Command, Message};
