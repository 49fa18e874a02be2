//! DHCP server (§4.3): a single-guest lease, not the pool this core was
//! adapted from. There is exactly one client this proxy will ever see, so
//! there is no lease table — `ProxyConfig::guest_ip` IS the one lease, and
//! a DISCOVER or REQUEST is answered from it directly.
//!
//! The first DHCP packet seen while the proxy is unconfigured triggers
//! auto-detect (§4.3): a [`RouteProbe`] is consulted for the host's own
//! address and default gateway, the guest's address is derived from the
//! host's, and [`ProxyConfig`] is populated and flipped to enabled. If the
//! probe fails, the packet is dropped and the guest's DHCP client will retry.

use crate::config::{ProxyConfig, LEASE_SECONDS, SYNTHETIC_HOST_MAC};
use crate::route_probe::{derive_guest_ip, RouteProbe};
use crate::wire::{ETHERNET_HEADER_LEN, IPV4_MIN_HEADER_LEN};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    DhcpMessageType, DhcpPacket, DhcpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

pub struct DhcpServer {
    route_probe: Box<dyn RouteProbe>,
}

impl DhcpServer {
    pub fn new(route_probe: Box<dyn RouteProbe>) -> Self {
        Self { route_probe }
    }

    /// Handle the UDP payload of a datagram addressed to port 67.
    ///
    /// Returns the reply frame to deliver to the guest, or `None` if the
    /// packet was malformed, not a message this server answers, or
    /// auto-detect was needed and failed.
    pub fn handle(
        &self,
        payload: &[u8],
        client_mac: EthernetAddress,
        config: &mut ProxyConfig,
    ) -> Option<Vec<u8>> {
        let packet = DhcpPacket::new_checked(payload).ok()?;
        let request = DhcpRepr::parse(&packet).ok()?;

        if !config.enabled {
            let route = self.route_probe.detect()?;
            let guest_ip = derive_guest_ip(route.host_ip);
            config.configure(guest_ip, route.gateway_ip, route.host_ip);
            tracing::debug!(
                guest_ip = %guest_ip,
                host_ip = %route.host_ip,
                "auto-detected network configuration from first DHCP request"
            );
        }
        config.guest_mac = Some(client_mac);

        let message_type = match request.message_type {
            DhcpMessageType::Discover => DhcpMessageType::Offer,
            DhcpMessageType::Request => DhcpMessageType::Ack,
            _ => return None,
        };

        let dns_servers = heapless::Vec::from_slice(&[Ipv4Address::from(config.dns_ip)]).ok();

        let reply = DhcpRepr {
            message_type,
            transaction_id: request.transaction_id,
            secs: 0,
            client_hardware_address: client_mac,
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip: Ipv4Address::from(config.guest_ip),
            server_ip: Ipv4Address::from(config.host_ip),
            router: Some(Ipv4Address::from(config.gateway_ip)),
            subnet_mask: Some(Ipv4Address::from(config.subnet_mask())),
            relay_agent_ip: Ipv4Address::UNSPECIFIED,
            broadcast: true,
            requested_ip: None,
            client_identifier: None,
            server_identifier: Some(Ipv4Address::from(config.host_ip)),
            parameter_request_list: None,
            dns_servers,
            max_size: None,
            lease_duration: Some(LEASE_SECONDS),
            renew_duration: Some(LEASE_SECONDS / 2),
            rebind_duration: Some(LEASE_SECONDS * 7 / 8),
            additional_options: &[],
        };

        Some(build_dhcp_frame(client_mac, &reply))
    }
}

fn build_dhcp_frame(client_mac: EthernetAddress, repr: &DhcpRepr<'_>) -> Vec<u8> {
    let dhcp_len = repr.buffer_len();
    let udp_len = 8 + dhcp_len;
    let ip_len = IPV4_MIN_HEADER_LEN + udp_len;
    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + ip_len];

    let eth_repr = EthernetRepr {
        src_addr: SYNTHETIC_HOST_MAC,
        dst_addr: client_mac,
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let caps = ChecksumCapabilities::default();
    let ip_repr = Ipv4Repr {
        src_addr: repr.server_ip,
        dst_addr: Ipv4Address::BROADCAST,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    ip_repr.emit(&mut ip_packet, &caps);

    let udp_repr = UdpRepr {
        src_port: DHCP_SERVER_PORT,
        dst_port: DHCP_CLIENT_PORT,
    };
    let mut udp_packet =
        UdpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV4_MIN_HEADER_LEN..]);
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        dhcp_len,
        |buf| {
            let mut dhcp_packet = DhcpPacket::new_unchecked(buf);
            repr.emit(&mut dhcp_packet)
                .expect("buffer sized from DhcpRepr::buffer_len");
        },
        &caps,
    );

    frame
}
