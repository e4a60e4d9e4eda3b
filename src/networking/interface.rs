use anyhow::{anyhow, Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Well-known external address used only to pick the outbound interface.
/// Connecting a UDP socket sends nothing.
const ROUTE_PROBE_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Determine the IP this node should advertise to peers.
///
/// Prefers the source address the OS picks for an outbound route; on hosts
/// with no such route it falls back to the primary interface address.
pub fn get_local_ip() -> Result<IpAddr> {
    match probe_outbound_ip(ROUTE_PROBE_ADDR) {
        Ok(ip) => Ok(ip),
        Err(probe_err) => {
            warn!("Route probe failed ({}), falling back to interface lookup", probe_err);
            local_ip().map_err(|err| {
                anyhow!("Failed to determine local IP: {} (route probe: {})", err, probe_err)
            })
        }
    }
}

/// Local address the OS would use to reach `target`
pub fn probe_outbound_ip(target: SocketAddr) -> Result<IpAddr> {
    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).context("Failed to bind probe socket")?;
    socket
        .connect(target)
        .with_context(|| format!("No route towards {}", target))?;
    let ip = socket.local_addr()?.ip();

    if ip.is_unspecified() {
        return Err(anyhow!("Probe socket was not assigned a local address"));
    }
    Ok(ip)
}

/// Addresses currently bound to any local interface
pub fn bound_addresses() -> Result<HashSet<IpAddr>> {
    let interfaces = get_if_addrs().context("Failed to get network interfaces")?;

    let mut addrs = HashSet::new();
    for interface in interfaces {
        let ip = match interface.addr {
            IfAddr::V4(addr) => IpAddr::V4(addr.ip),
            IfAddr::V6(addr) => IpAddr::V6(addr.ip),
        };

        // Skip interfaces without a valid IP
        if ip.is_unspecified() || ip.is_multicast() {
            continue;
        }

        debug!("Local interface: {} - {}", interface.name, ip);
        addrs.insert(ip);
    }

    Ok(addrs)
}

/// The set of addresses that identify this node on the wire.
///
/// Beacons whose source is in this set are our own and get ignored.
pub struct LocalAddresses {
    addrs: RwLock<HashSet<IpAddr>>,
}

impl LocalAddresses {
    /// Build the set from the interface table plus the advertised IP
    pub fn detect(advertised: IpAddr) -> Self {
        let local = Self::from_addrs([advertised]);
        local.refresh(advertised);
        local
    }

    /// Build the set from known addresses without touching the OS
    pub fn from_addrs<I: IntoIterator<Item = IpAddr>>(addrs: I) -> Self {
        Self {
            addrs: RwLock::new(addrs.into_iter().collect()),
        }
    }

    /// Re-read the interface table.
    ///
    /// If the table cannot be read the previous set is kept, with the
    /// advertised IP added.
    pub fn refresh(&self, advertised: IpAddr) {
        match bound_addresses() {
            Ok(mut addrs) => {
                addrs.insert(advertised);
                info!("Local address set refreshed: {} addresses", addrs.len());
                *self.addrs.write() = addrs;
            }
            Err(err) => {
                warn!("Keeping previous local address set: {}", err);
                self.addrs.write().insert(advertised);
            }
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addrs.read().contains(ip)
    }
}
