use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use super::interface::{self, LocalAddresses};
use super::peers::PeerRegistry;

/// Prefix identifying a presence beacon
pub const BEACON_TAG: &str = "helloo:";
const RECV_BUFFER_SIZE: usize = 1024;

/// Resolves the IP to advertise; called once per beacon tick
pub type IpResolver = fn() -> Result<IpAddr>;

/// Settings for the beacon transmitter and listener
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Where the listener binds
    pub listen_addr: SocketAddr,
    /// Where beacons are sent
    pub broadcast_addr: SocketAddr,
    /// Time between beacons
    pub broadcast_interval: Duration,
}

/// Encode the beacon advertising `ip`
pub fn beacon_payload(ip: &IpAddr) -> Vec<u8> {
    format!("{}{}", BEACON_TAG, ip).into_bytes()
}

/// Parse a received datagram, returning the advertised text for a valid
/// beacon. Anything else is not a beacon.
pub fn parse_beacon(datagram: &[u8]) -> Option<String> {
    let tag = BEACON_TAG.as_bytes();
    if datagram.len() > tag.len() && datagram.starts_with(tag) {
        Some(String::from_utf8_lossy(&datagram[tag.len()..]).into_owned())
    } else {
        None
    }
}

/// LAN discovery service: announces this node and records the peers it
/// hears from
pub struct PeerDiscovery {
    config: DiscoveryConfig,
    registry: Arc<PeerRegistry>,
    local_addrs: Arc<LocalAddresses>,
    advertised_ip: Arc<RwLock<IpAddr>>,
    resolve_ip: IpResolver,
}

impl PeerDiscovery {
    pub fn new(
        config: DiscoveryConfig,
        registry: Arc<PeerRegistry>,
        local_addrs: Arc<LocalAddresses>,
        advertised_ip: IpAddr,
    ) -> Self {
        Self {
            config,
            registry,
            local_addrs,
            advertised_ip: Arc::new(RwLock::new(advertised_ip)),
            resolve_ip: interface::get_local_ip,
        }
    }

    /// Replace the resolver used to track local IP changes
    pub fn with_ip_resolver(mut self, resolve_ip: IpResolver) -> Self {
        self.resolve_ip = resolve_ip;
        self
    }

    /// Bind both sockets and spawn the transmitter and listener tasks.
    ///
    /// Both tasks run until `cancel` fires. A zero interval or failing to
    /// bind is an environment error and is returned to the caller.
    pub async fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        if self.config.broadcast_interval.is_zero() {
            bail!("Broadcast interval must be non-zero");
        }

        let listen_socket = UdpSocket::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind discovery listener on {}", self.config.listen_addr))?;
        info!("Listening for beacons on {}", listen_socket.local_addr()?);

        let bind_addr: SocketAddr = if self.config.broadcast_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let send_socket = UdpSocket::bind(bind_addr)
            .await
            .context("Failed to bind beacon socket")?;
        send_socket
            .set_broadcast(true)
            .context("Failed to enable broadcast on beacon socket")?;

        let transmitter = tokio::spawn(run_transmitter(
            send_socket,
            self.config.clone(),
            self.advertised_ip.clone(),
            self.local_addrs.clone(),
            self.resolve_ip,
            cancel.clone(),
        ));

        let listener = tokio::spawn(run_listener(
            listen_socket,
            self.registry.clone(),
            self.local_addrs.clone(),
            cancel,
        ));

        Ok(vec![transmitter, listener])
    }

    /// Peers heard from within the timeout window
    pub fn active_peers(&self) -> Vec<String> {
        self.registry.active_peers()
    }

    /// The IP currently advertised in beacons
    pub fn advertised_ip(&self) -> IpAddr {
        *self.advertised_ip.read()
    }
}

/// Broadcast a beacon once per interval until cancelled.
///
/// The outbound IP is re-resolved each tick; when it changes, the beacon
/// and the local address set follow it.
async fn run_transmitter(
    socket: UdpSocket,
    config: DiscoveryConfig,
    advertised_ip: Arc<RwLock<IpAddr>>,
    local_addrs: Arc<LocalAddresses>,
    resolve_ip: IpResolver,
    cancel: CancellationToken,
) {
    let period = config.broadcast_interval;
    let mut ticker = interval_at(Instant::now() + period, period);

    info!("Broadcasting beacons to {} every {:?}", config.broadcast_addr, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Beacon transmitter shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        if let Ok(current) = resolve_ip() {
            let previous = *advertised_ip.read();
            if current != previous {
                info!("Local IP changed from {} to {}", previous, current);
                *advertised_ip.write() = current;
                local_addrs.refresh(current);
            }
        }

        let payload = beacon_payload(&advertised_ip.read());
        match socket.send_to(&payload, config.broadcast_addr).await {
            Ok(_) => debug!("Sent beacon to {}", config.broadcast_addr),
            Err(e) => warn!("Failed to send beacon: {}", e),
        }
    }
}

/// Receive beacons until cancelled, recording every sender that is not us.
///
/// Receive errors are logged and the loop keeps going.
async fn run_listener(
    socket: UdpSocket,
    registry: Arc<PeerRegistry>,
    local_addrs: Arc<LocalAddresses>,
    cancel: CancellationToken,
) {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        let (n, remote) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Beacon listener shutting down");
                break;
            }
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving beacon: {}", e);
                    continue;
                }
            },
        };

        let sender = remote.ip();
        if local_addrs.contains(&sender) {
            continue;
        }

        match parse_beacon(&buffer[..n]) {
            Some(advertised) => {
                debug!("Beacon from {} advertising {}", sender, advertised);
                registry.add_or_update(&sender.to_string());
            }
            None => debug!("Ignoring {} byte datagram from {}", n, sender),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback_config(listen_port: u16, interval: Duration) -> DiscoveryConfig {
        DiscoveryConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, listen_port)),
            broadcast_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, listen_port)),
            broadcast_interval: interval,
        }
    }

    #[test]
    fn test_beacon_format() {
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        assert_eq!(beacon_payload(&ip), b"helloo:192.168.1.20".to_vec());
        assert_eq!(parse_beacon(b"helloo:192.168.1.20"), Some("192.168.1.20".to_string()));
        assert_eq!(parse_beacon(b"helloo:"), None);
        assert_eq!(parse_beacon(b"hello:1.2.3.4"), None);
        assert_eq!(parse_beacon(b""), None);
    }

    #[tokio::test]
    async fn test_listener_records_beacon_senders() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let local = Arc::new(LocalAddresses::from_addrs(std::iter::empty()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_listener(socket, registry.clone(), local, cancel.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await?;
        sender.send_to(b"garbage", addr).await?;
        sender.send_to(b"helloo:", addr).await?;
        sender.send_to(b"helloo:10.1.2.3", addr).await?;

        let mut peers = Vec::new();
        for _ in 0..50 {
            peers = registry.active_peers();
            if !peers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Keyed by the datagram source, not the advertised text
        assert_eq!(peers, vec!["127.0.0.1".to_string()]);

        cancel.cancel();
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_listener_ignores_own_beacons() -> Result<()> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let local = Arc::new(LocalAddresses::from_addrs([IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_listener(socket, registry.clone(), local, cancel.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await?;
        sender.send_to(b"helloo:127.0.0.1", addr).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(registry.active_peers().is_empty());

        cancel.cancel();
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_transmitter_and_listener_end_to_end() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        // Reserve a free port for the listener
        let port = std::net::UdpSocket::bind("127.0.0.1:0")?.local_addr()?.port();
        let config = loopback_config(port, Duration::from_millis(50));

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let local = Arc::new(LocalAddresses::from_addrs(std::iter::empty()));
        let advertised: IpAddr = "10.9.8.7".parse()?;
        let discovery = PeerDiscovery::new(config, registry.clone(), local, advertised)
            .with_ip_resolver(|| Ok(IpAddr::from([10, 9, 8, 7])));

        let cancel = CancellationToken::new();
        let handles = discovery.start(cancel.clone()).await?;

        let mut peers = Vec::new();
        for _ in 0..50 {
            peers = discovery.active_peers();
            if !peers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(peers, vec!["127.0.0.1".to_string()]);

        cancel.cancel();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() -> Result<()> {
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let local = Arc::new(LocalAddresses::from_addrs(std::iter::empty()));
        let discovery = PeerDiscovery::new(
            loopback_config(0, Duration::ZERO),
            registry,
            local,
            "10.9.8.7".parse()?,
        );

        let cancel = CancellationToken::new();
        assert!(discovery.start(cancel.clone()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_beacon_follows_local_ip_change() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        // Capture beacons on a plain socket instead of the listener
        let sink = UdpSocket::bind("127.0.0.1:0").await?;
        let config = DiscoveryConfig {
            listen_addr: "127.0.0.1:0".parse()?,
            broadcast_addr: sink.local_addr()?,
            broadcast_interval: Duration::from_millis(50),
        };

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let local = Arc::new(LocalAddresses::from_addrs([IpAddr::from([10, 9, 8, 7])]));
        let discovery = PeerDiscovery::new(config, registry, local.clone(), "10.9.8.7".parse()?)
            .with_ip_resolver(|| Ok(IpAddr::from([10, 9, 8, 42])));

        let cancel = CancellationToken::new();
        let handles = discovery.start(cancel.clone()).await?;

        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), sink.recv_from(&mut buffer)).await??;

        assert_eq!(parse_beacon(&buffer[..n]), Some("10.9.8.42".to_string()));
        assert_eq!(discovery.advertised_ip(), IpAddr::from([10, 9, 8, 42]));
        assert!(local.contains(&IpAddr::from([10, 9, 8, 42])));

        cancel.cancel();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}
