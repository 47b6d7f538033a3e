//! Network address classification for the SSRF guard.

use std::net::IpAddr;

/// Name resolution seam: `fetch_url` re-resolves the host on every redirect
/// hop through this trait so tests can script address classes.
pub trait NameResolver {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the OS resolver.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        super::resolve_host(host, port)
    }
}

/// True when the address is in a public class: not private, loopback,
/// link-local, multicast, or unspecified.
pub fn is_public_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (segments[0] & 0xffc0) == 0xfe80
                // IPv4-mapped addresses inherit the V4 classification
                || v6.to_ipv4_mapped().is_some_and(|v4| !is_public_ip(IpAddr::V4(v4))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip")
    }

    #[test]
    fn private_ranges_rejected() {
        for addr in [
            "10.0.0.1",
            "172.16.4.2",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.0.9",
            "224.0.0.1",
            "0.0.0.0",
            "100.64.1.1",
        ] {
            assert!(!is_public_ip(ip(addr)), "{addr} should be non-public");
        }
    }

    #[test]
    fn public_addresses_accepted() {
        for addr in ["1.1.1.1", "8.8.8.8", "93.184.216.34", "2606:4700::1111"] {
            assert!(is_public_ip(ip(addr)), "{addr} should be public");
        }
    }

    #[test]
    fn ipv6_special_ranges_rejected() {
        for addr in ["::1", "::", "fe80::1", "fc00::1", "fd12::1", "ff02::1", "::ffff:10.0.0.1"] {
            assert!(!is_public_ip(ip(addr)), "{addr} should be non-public");
        }
    }
}
