use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Registry of recently seen peers, mapping address to last-seen time.
///
/// Entries are never swept in the background. Listing the registry is what
/// evicts stale peers: `active_peers` removes every record whose age has
/// reached the timeout before returning the survivors.
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
}

impl PeerRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Insert a peer or refresh its last-seen time to now
    pub fn add_or_update(&self, address: &str) {
        let mut peers = self.peers.lock();
        if peers.insert(address.to_string(), Instant::now()).is_none() {
            info!("✅ New peer discovered: {}", address);
        }
    }

    /// Addresses of all peers seen within the timeout window.
    ///
    /// Expired records are deleted as a side effect. Result order is
    /// unspecified.
    pub fn active_peers(&self) -> Vec<String> {
        let mut peers = self.peers.lock();
        Self::evict_expired(&mut peers, self.timeout, Instant::now());
        peers.keys().cloned().collect()
    }

    /// Evict expired records without listing, returning how many were removed
    pub fn sweep(&self) -> usize {
        let mut peers = self.peers.lock();
        Self::evict_expired(&mut peers, self.timeout, Instant::now())
    }

    fn evict_expired(
        peers: &mut HashMap<String, Instant>,
        timeout: Duration,
        now: Instant,
    ) -> usize {
        let before = peers.len();
        peers.retain(|address, last_seen| {
            let expired = now.saturating_duration_since(*last_seen) >= timeout;
            if expired {
                info!("👋 Removed peer due to timeout: {}", address);
            }
            !expired
        });
        before - peers.len()
    }
}
