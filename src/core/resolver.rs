//! Address assembly and local interface selection.

use std::net::{Ipv4Addr, SocketAddr};

use ipnetwork::Ipv4Network;
use nix::ifaddrs::getifaddrs;

use crate::core::error::{SocketError, SocketResult};

/// Builds a concrete socket address from a port and a dotted-quad target.
/// An empty target yields the wildcard bind address.
pub fn assemble_address(port: u16, target: &str) -> SocketResult<SocketAddr> {
    if target.is_empty() {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    let ip: Ipv4Addr = target
        .parse()
        .map_err(|_| SocketError::InvalidAddress(target.to_string()))?;
    Ok(SocketAddr::from((ip, port)))
}

/// Returns every local IPv4 interface address, loopback included.
pub fn enumerate_local_addresses() -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            eprintln!("Error getting local addresses: {}", e);
            return ips;
        }
    };

    for ifaddr in addrs {
        if let Some(address) = ifaddr.address {
            if let Some(sin) = address.as_sockaddr_in() {
                ips.push(sin.ip());
            }
        }
    }

    ips
}

/// Picks the local interface address most likely to reach `destination`:
/// the first local address sharing the destination's leading octets once
/// the final dotted octet is stripped. `None` means the caller should
/// fall back to a wildcard bind.
pub fn best_local_address(destination: &str) -> Option<Ipv4Addr> {
    if destination.is_empty() {
        return None;
    }

    let prefix = match destination.rfind('.') {
        Some(index) => &destination[..index],
        None => destination,
    };

    enumerate_local_addresses().into_iter().find(|ip| {
        let text = ip.to_string();
        match text.strip_prefix(prefix) {
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    })
}

/// Directed broadcast address for the local subnet containing `destination`,
/// derived from the matching interface's netmask.
pub fn broadcast_address(destination: &str) -> Option<Ipv4Addr> {
    let dest: Ipv4Addr = destination.parse().ok()?;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            eprintln!("Error getting local addresses: {}", e);
            return None;
        }
    };

    for ifaddr in addrs {
        let sin = match ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            Some(sin) => sin.ip(),
            None => continue,
        };
        let mask = match ifaddr.netmask.as_ref().and_then(|m| m.as_sockaddr_in()) {
            Some(mask) => mask.ip(),
            None => continue,
        };

        if let Ok(network) = Ipv4Network::with_netmask(sin, mask) {
            if network.contains(dest) {
                return Some(network.broadcast());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_empty_target_is_wildcard() {
        let addr = assemble_address(8999, "").unwrap();
        assert_eq!(addr, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8999)));
    }

    #[test]
    fn assemble_concrete_target() {
        let addr = assemble_address(80, "192.168.1.16").unwrap();
        assert_eq!(addr, SocketAddr::from((Ipv4Addr::new(192, 168, 1, 16), 80)));
    }

    #[test]
    fn assemble_rejects_garbage() {
        assert!(matches!(
            assemble_address(80, "not-an-address"),
            Err(SocketError::InvalidAddress(_))
        ));
    }

    #[test]
    fn local_addresses_include_loopback() {
        let ips = enumerate_local_addresses();
        assert!(ips.contains(&Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn best_local_address_matches_loopback_prefix() {
        assert_eq!(best_local_address("127.0.0.50"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn best_local_address_empty_destination() {
        assert_eq!(best_local_address(""), None);
    }

    #[test]
    fn best_local_address_unreachable_prefix() {
        // TEST-NET-3, should never be a local interface
        assert_eq!(best_local_address("203.0.113.9"), None);
    }

    #[test]
    fn broadcast_address_for_loopback_subnet() {
        assert_eq!(
            broadcast_address("127.0.0.1"),
            Some(Ipv4Addr::new(127, 255, 255, 255))
        );
    }
}
