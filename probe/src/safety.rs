//! Private / reserved address classification.
//!
//! Measurement targets must stay on the public internet. Every address the
//! probe resolves itself, and every address a tool reports back, goes
//! through this filter before any traffic or result leaves the process.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// True iff `addr` must not be measured: private, loopback, link-local,
/// CGNAT, multicast, broadcast or otherwise reserved space.
pub fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            // v4-in-v6 gets judged as the embedded v4 address
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_v4(mapped);
            }
            is_private_v6(v6)
        }
    }
}

/// Parse-and-check helper for addresses arriving as strings out of tool
/// output. Returns `None` when the string is not an IP address at all.
pub fn is_private_ip_str(s: &str) -> Option<bool> {
    s.trim().parse::<IpAddr>().ok().map(is_private_ip)
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    addr.is_private()                                   // 10/8, 172.16/12, 192.168/16
        || addr.is_loopback()                           // 127/8
        || addr.is_link_local()                         // 169.254/16
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64) // 100.64/10 CGNAT
        || addr.is_unspecified()                        // 0.0.0.0
        || octets[0] == 0                               // 0/8 "this network"
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0) // 192.0.0/24 IETF
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2) // 192.0.2/24 TEST-NET-1
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18) // 198.18/15 benchmarking
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100) // TEST-NET-2
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113) // TEST-NET-3
        || addr.is_multicast()                          // 224/4
        || octets[0] >= 240                             // 240/4 reserved + broadcast
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    let segments = addr.segments();
    addr.is_loopback()                                  // ::1
        || addr.is_unspecified()                        // ::
        || (segments[0] & 0xfe00) == 0xfc00             // fc00::/7 ULA
        || (segments[0] & 0xffc0) == 0xfe80             // fe80::/10 link-local
        || (segments[0] & 0xff00) == 0xff00             // ff00::/8 multicast
        || segments[0] == 0x2001 && segments[1] == 0xdb8 // 2001:db8::/32 documentation
        || (segments[0] == 0x0064 && segments[1] == 0xff9b) // 64:ff9b::/96 NAT64 well-known
        || segments[0] == 0x0100                        // 100::/64 discard
}

/// Error text used uniformly when a measurement is aborted by this filter.
pub const PRIVATE_IP_ERROR: &str = "Private IP ranges are not allowed.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_addresses_are_rejected() {
        for addr in [
            "10.0.0.1",
            "172.16.0.1",
            "192.168.0.1",
            "127.0.0.1",
            "169.254.0.1",
            "100.64.0.1",
            "fd00::1",
            "fe80::1",
            "::1",
            "ff00::1",
        ] {
            assert!(
                is_private_ip(addr.parse().unwrap()),
                "{} should be private",
                addr
            );
        }
    }

    #[test]
    fn public_addresses_pass() {
        for addr in ["1.1.1.1", "8.8.8.8", "93.184.216.34", "2606:4700:4700::1111"] {
            assert!(
                !is_private_ip(addr.parse().unwrap()),
                "{} should be public",
                addr
            );
        }
    }

    #[test]
    fn mapped_v4_in_v6_uses_the_v4_rules() {
        assert!(is_private_ip("::ffff:192.168.1.1".parse().unwrap()));
        assert!(!is_private_ip("::ffff:8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn reserved_corner_ranges() {
        assert!(is_private_ip("0.1.2.3".parse().unwrap()));
        assert!(is_private_ip("198.18.0.1".parse().unwrap()));
        assert!(is_private_ip("203.0.113.9".parse().unwrap()));
        assert!(is_private_ip("255.255.255.255".parse().unwrap()));
        assert!(is_private_ip("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn parse_helper_handles_junk() {
        assert_eq!(is_private_ip_str("not-an-ip"), None);
        assert_eq!(is_private_ip_str(" 10.0.0.1 "), Some(true));
        assert_eq!(is_private_ip_str("1.1.1.1"), Some(false));
    }
}
