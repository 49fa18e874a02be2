//! Host routing-table probe used to auto-configure the proxy on first DHCP
//! exchange (§4.3).
//!
//! Production code shells out to the platform routing command, the same way
//! the lineage this crate grew out of shells out to platform-specific helper
//! binaries for capability probing: a command is run, its stdout is parsed,
//! and failure just means the feature stays unavailable rather than
//! panicking.

use std::net::Ipv4Addr;
use std::process::Command;

/// Result of probing the host's route to an external address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectedRoute {
    pub host_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
}

/// Abstraction over "how do we learn our host/gateway IPs", so DHCP
/// auto-detect can be exercised in tests without touching the real routing
/// table.
pub trait RouteProbe: Send {
    fn detect(&self) -> Option<DetectedRoute>;
}

/// Shells out to `ip route get 8.8.8.8` and parses the `src` and `via`
/// fields out of the single line of output.
#[derive(Default)]
pub struct SystemRouteProbe;

impl RouteProbe for SystemRouteProbe {
    fn detect(&self) -> Option<DetectedRoute> {
        let output = Command::new("ip")
            .args(["route", "get", "8.8.8.8"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ip_route_get(&stdout)
    }
}

/// Parses the line `ip route get 8.8.8.8` prints, e.g.
/// `8.8.8.8 via 192.168.1.1 dev eth0 src 192.168.1.42 uid 0`.
fn parse_ip_route_get(stdout: &str) -> Option<DetectedRoute> {
    let mut gateway_ip = None;
    let mut host_ip = None;

    let mut tokens = stdout.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        match token {
            "via" => gateway_ip = tokens.next().and_then(|s| s.parse().ok()),
            "src" => host_ip = tokens.next().and_then(|s| s.parse().ok()),
            _ => {}
        }
    }

    Some(DetectedRoute {
        host_ip: host_ip?,
        gateway_ip: gateway_ip.unwrap_or(host_ip?),
    })
}

/// Derives the guest's IP by incrementing the host's last octet, wrapping
/// 254 back to 2 as the reference behavior does (Open Question 3 in
/// DESIGN.md: this can collide with another host on the LAN and the spec
/// records that without endorsing it).
pub fn derive_guest_ip(host_ip: Ipv4Addr) -> Ipv4Addr {
    let octets = host_ip.octets();
    let next_last = if octets[3] >= 254 { 2 } else { octets[3] + 1 };
    Ipv4Addr::new(octets[0], octets[1], octets[2], next_last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_via_and_src() {
        let out = "8.8.8.8 via 192.168.1.1 dev eth0 src 192.168.1.42 uid 0\n";
        let route = parse_ip_route_get(out).unwrap();
        assert_eq!(route.host_ip, Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(route.gateway_ip, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn missing_src_fails() {
        let out = "8.8.8.8 via 192.168.1.1 dev eth0\n";
        assert!(parse_ip_route_get(out).is_none());
    }

    #[test]
    fn derive_guest_ip_increments_last_octet() {
        assert_eq!(
            derive_guest_ip(Ipv4Addr::new(192, 168, 1, 10)),
            Ipv4Addr::new(192, 168, 1, 11)
        );
    }

    #[test]
    fn derive_guest_ip_wraps_at_254() {
        assert_eq!(
            derive_guest_ip(Ipv4Addr::new(10, 0, 0, 254)),
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }
}
