use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Normalized client identity derived from a peer address.
///
/// IPv6 loopback collapses to `127.0.0.1` and IPv4-mapped IPv6 addresses to
/// their IPv4 form, so a client is keyed the same whether it reached a
/// dual-stack listener over v4 or v6.
pub fn client_identity(addr: &SocketAddr) -> String {
    normalize_ip(addr.ip()).to_string()
}

/// Canonical form used for ledger keys and allowlist entries alike.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip.to_canonical() {
        IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_is_kept() {
        let addr: SocketAddr = "203.0.113.5:51000".parse().unwrap();
        assert_eq!(client_identity(&addr), "203.0.113.5");
    }

    #[test]
    fn ipv6_loopback_collapses() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(client_identity(&addr), "127.0.0.1");
    }

    #[test]
    fn ipv4_mapped_collapses() {
        let addr: SocketAddr = "[::ffff:198.51.100.7]:443".parse().unwrap();
        assert_eq!(client_identity(&addr), "198.51.100.7");
    }

    #[test]
    fn plain_ipv6_is_kept() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(client_identity(&addr), "2001:db8::1");
    }
}
