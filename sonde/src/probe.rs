//! Detecting IPv6 connectivity.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};

/// Any global address works; connecting a UDP socket sends nothing.
const PROBE_ADDR: Ipv6Addr = Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888);

/// Whether `ip` is a unicast address usable beyond the local link.
pub fn is_global_unicast(ip: &Ipv6Addr) -> bool {
    let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() || link_local)
}

/// Asks the routing table for a source address towards a global IPv6 destination and reports
/// whether that source is global unicast.
///
/// Any failure along the way (no IPv6 stack, no route) means no IPv6 connectivity.
pub fn has_ipv6() -> bool {
    has_global_source(SocketAddr::new(IpAddr::V6(PROBE_ADDR), 53))
}

/// Whether the source address picked for reaching `destination` is global unicast.
fn has_global_source(destination: SocketAddr) -> bool {
    let socket = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!("IPv6 probe: could not bind: {}", e);
            return false;
        }
    };
    if let Err(e) = socket.connect(destination) {
        tracing::debug!("IPv6 probe: no route: {}", e);
        return false;
    }

    match socket.local_addr() {
        Ok(SocketAddr::V6(local)) => {
            let global = is_global_unicast(local.ip());
            tracing::debug!("IPv6 probe: source address {}, global: {}", local.ip(), global);
            global
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_unicast() {
        let global: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let ula: Ipv6Addr = "fd00::1".parse().unwrap();
        let link_local: Ipv6Addr = "fe80::1".parse().unwrap();
        let multicast: Ipv6Addr = "ff02::fb".parse().unwrap();

        assert!(is_global_unicast(&global));
        assert!(is_global_unicast(&ula));
        assert!(!is_global_unicast(&link_local));
        assert!(!is_global_unicast(&multicast));
        assert!(!is_global_unicast(&Ipv6Addr::LOCALHOST));
        assert!(!is_global_unicast(&Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn loopback_route_is_not_connectivity() {
        // either no IPv6 stack, or a ::1 source address; neither counts
        let loopback = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 53);
        assert!(!has_global_source(loopback));
    }
}
