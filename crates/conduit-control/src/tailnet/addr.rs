use std::net::{IpAddr, Ipv6Addr};

use rand::RngCore;
use uuid::Uuid;

/// `fd7a:115c:a1e0::/48`, the overlay's service prefix.
pub const SERVICE_PREFIX: [u8; 6] = [0xfd, 0x7a, 0x11, 0x5c, 0xa1, 0xe0];

/// Address older agents listen on instead of one derived from their id.
pub const LEGACY_AGENT_IP: Ipv6Addr = Ipv6Addr::new(
    0xfd7a, 0x115c, 0xa1e0, 0x49d6, 0xb259, 0xb7ac, 0xb1b2, 0x48f4,
);

fn with_prefix(mut bytes: [u8; 16]) -> Ipv6Addr {
    bytes[..SERVICE_PREFIX.len()].copy_from_slice(&SERVICE_PREFIX);
    Ipv6Addr::from(bytes)
}

/// The agent's overlay address: the service prefix followed by the last ten bytes of its id.
pub fn agent_ip(agent_id: Uuid) -> Ipv6Addr {
    with_prefix(*agent_id.as_bytes())
}

pub fn random_ip() -> Ipv6Addr {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    with_prefix(bytes)
}

pub fn in_service_prefix(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => v6.octets()[..SERVICE_PREFIX.len()] == SERVICE_PREFIX,
        IpAddr::V4(_) => false,
    }
}

/// Renders a host address in the CIDR form nodes advertise.
pub fn host_prefix(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}/32"),
        IpAddr::V6(v6) => format!("{v6}/128"),
    }
}

/// Parses an advertised address, with or without a prefix length.
pub fn parse_advertised(raw: &str) -> Option<IpAddr> {
    raw.split_once('/')
        .map_or(raw, |(ip, _)| ip)
        .parse()
        .ok()
}

/// Picks the address to dial an agent on. Agents that only advertise the legacy address are
/// reached there; everything else uses the id-derived address.
pub fn dial_ip(agent_id: Uuid, advertised: &[IpAddr]) -> IpAddr {
    let derived = IpAddr::V6(agent_ip(agent_id));
    let legacy = IpAddr::V6(LEGACY_AGENT_IP);
    if advertised.contains(&legacy) && !advertised.contains(&derived) {
        return legacy;
    }
    derived
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ip_keeps_the_tail_of_the_id() {
        let id = Uuid::parse_str("01234567-89ab-cdef-0123-456789abcdef").unwrap();
        let ip = agent_ip(id);
        assert_eq!(ip.to_string(), "fd7a:115c:a1e0:cdef:123:4567:89ab:cdef");
        assert!(in_service_prefix(&IpAddr::V6(ip)));
    }

    #[test]
    fn random_ips_stay_in_prefix() {
        for _ in 0..16 {
            assert!(in_service_prefix(&IpAddr::V6(random_ip())));
        }
        assert!(!in_service_prefix(&"fd00::1".parse().unwrap()));
    }

    #[test]
    fn advertised_addresses_parse_with_and_without_length() {
        assert_eq!(
            parse_advertised("fd7a:115c:a1e0::1/128"),
            Some("fd7a:115c:a1e0::1".parse().unwrap())
        );
        assert_eq!(parse_advertised("10.0.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parse_advertised("nope/128"), None);
        assert_eq!(host_prefix("fd7a:115c:a1e0::1".parse().unwrap()), "fd7a:115c:a1e0::1/128");
    }

    #[test]
    fn legacy_address_only_when_it_is_all_the_agent_advertises() {
        let id = Uuid::new_v4();
        let derived = IpAddr::V6(agent_ip(id));
        let legacy = IpAddr::V6(LEGACY_AGENT_IP);
        assert_eq!(dial_ip(id, &[legacy]), legacy);
        assert_eq!(dial_ip(id, &[legacy, derived]), derived);
        assert_eq!(dial_ip(id, &[derived]), derived);
        assert_eq!(dial_ip(id, &[]), derived);
    }
}
