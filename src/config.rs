// src/config.rs
//
// Node configuration, loaded from the environment (and an optional .env file)

use log::warn;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::networking::discovery::DiscoveryConfig;
use crate::networking::file_transfer::TransferConfig;

pub const DEFAULT_DISCOVERY_PORT: u16 = 8829;
pub const DEFAULT_TRANSFER_PORT: u16 = 8830;
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SHARED_DIR: &str = "shared_files";

/// Process-wide settings for a node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// UDP port used for beacons (send and receive)
    pub discovery_port: u16,

    /// TCP port the transfer server listens on and clients dial
    pub transfer_port: u16,

    /// How often a beacon is broadcast
    pub broadcast_interval: Duration,

    /// Peers not heard from within this window are evicted
    pub peer_timeout: Duration,

    /// Directory offered to peers and receiving downloads
    pub shared_dir: PathBuf,

    /// Destination host for beacons
    pub broadcast_host: IpAddr,

    /// Optional cap on concurrently handled server connections
    pub max_connections: Option<usize>,

    /// Optional deadline for a whole server-side exchange
    pub io_timeout: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            shared_dir: PathBuf::from(DEFAULT_SHARED_DIR),
            broadcast_host: IpAddr::V4(Ipv4Addr::BROADCAST),
            max_connections: None, // Unbounded unless configured
            io_timeout: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Missing keys keep their defaults; values that fail to parse are
    /// logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            discovery_port: parse_var(&lookup, "P2P_DISCOVERY_PORT")
                .unwrap_or(defaults.discovery_port),
            transfer_port: parse_var(&lookup, "P2P_TRANSFER_PORT")
                .unwrap_or(defaults.transfer_port),
            broadcast_interval: parse_var::<u64, _>(&lookup, "P2P_BROADCAST_INTERVAL_SECS")
                .filter(|secs| nonzero("P2P_BROADCAST_INTERVAL_SECS", *secs))
                .map(Duration::from_secs)
                .unwrap_or(defaults.broadcast_interval),
            peer_timeout: parse_var(&lookup, "P2P_PEER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.peer_timeout),
            shared_dir: lookup("P2P_SHARED_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.shared_dir),
            broadcast_host: parse_var(&lookup, "P2P_BROADCAST_ADDR")
                .unwrap_or(defaults.broadcast_host),
            max_connections: parse_var::<usize, _>(&lookup, "P2P_MAX_CONNECTIONS")
                .filter(|n| *n > 0),
            io_timeout: parse_var::<u64, _>(&lookup, "P2P_IO_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    /// Settings for the beacon transmitter and listener
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.discovery_port),
            broadcast_addr: SocketAddr::new(self.broadcast_host, self.discovery_port),
            broadcast_interval: self.broadcast_interval,
        }
    }

    /// Settings for the transfer server
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.transfer_port),
            max_connections: self.max_connections,
            io_timeout: self.io_timeout,
        }
    }
}

fn nonzero(key: &str, secs: u64) -> bool {
    if secs == 0 {
        warn!("Ignoring invalid value for {}: must be at least 1", key);
    }
    secs > 0
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}
