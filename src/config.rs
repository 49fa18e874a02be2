//! Process-wide proxy configuration.
//!
//! Held as a field of [`crate::Proxy`] rather than as a true global, per the
//! Design Notes: a single owning aggregate removes the implicit shared-state
//! problem of the reference implementation without changing any wire
//! semantics.

use smoltcp::wire::EthernetAddress;
use std::net::Ipv4Addr;

/// Fixed MAC the proxy presents to the guest for every host-originated
/// address: the gateway, DNS, and every NAT'd remote all appear to live
/// behind this one synthetic hardware address.
pub const SYNTHETIC_HOST_MAC: EthernetAddress =
    EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

/// DHCP lease duration advertised to the guest, in seconds.
pub const LEASE_SECONDS: u32 = 86_400;

/// Configuration for the guest-facing virtual LAN.
///
/// Invariant: once [`ProxyConfig::enabled`] is true, none of the IPv4 fields
/// are mutated for the lifetime of the attachment. `enabled == false` implies
/// every table owned by [`crate::Proxy`] is empty.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// IPv4 address assigned to the guest.
    pub guest_ip: Ipv4Addr,
    /// IPv4 address the guest believes is its default gateway.
    pub gateway_ip: Ipv4Addr,
    /// IPv4 address advertised to the guest as its DNS resolver.
    pub dns_ip: Ipv4Addr,
    /// IPv4 address this proxy uses as its own DHCP "server identifier".
    pub host_ip: Ipv4Addr,
    /// Guest's hardware address, learned from the first ARP or DHCP packet.
    pub guest_mac: Option<EthernetAddress>,
    /// Whether the stack has been configured (by explicit call or DHCP
    /// auto-detect) and is actively proxying traffic.
    pub enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            guest_ip: Ipv4Addr::UNSPECIFIED,
            gateway_ip: Ipv4Addr::UNSPECIFIED,
            dns_ip: Ipv4Addr::new(8, 8, 8, 8),
            host_ip: Ipv4Addr::UNSPECIFIED,
            guest_mac: None,
            enabled: false,
        }
    }
}

impl ProxyConfig {
    /// Explicitly configure and enable the proxy. `guest_ip` of
    /// [`Ipv4Addr::UNSPECIFIED`] disables it instead (the caller is expected
    /// to also clear every table; see [`crate::Proxy::configure`]).
    pub fn configure(&mut self, guest_ip: Ipv4Addr, gateway_ip: Ipv4Addr, host_ip: Ipv4Addr) {
        if guest_ip.is_unspecified() {
            self.enabled = false;
            self.guest_ip = Ipv4Addr::UNSPECIFIED;
            self.gateway_ip = Ipv4Addr::UNSPECIFIED;
            self.host_ip = Ipv4Addr::UNSPECIFIED;
            return;
        }

        self.guest_ip = guest_ip;
        self.gateway_ip = gateway_ip;
        self.host_ip = host_ip;
        self.enabled = true;
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }
}
