//! The aggregate owning a single guest attachment (Design Notes §9): one
//! `Proxy` per emulated NIC, holding configuration and every flow table.
//! There is deliberately no process-wide global or lazily-initialized
//! singleton here — the lineage this grew from passed shared state through
//! `Arc<Mutex<_>>` handles across tokio tasks; this core has one owner and
//! one thread, so a plain struct is enough.

use crate::arp;
use crate::config::{ProxyConfig, SYNTHETIC_HOST_MAC};
use crate::dhcp::{self, DhcpServer};
use crate::dispatch::Handled;
use crate::guest_io::GuestIo;
use crate::route_probe::RouteProbe;
use crate::tcp_in::{PortMapping, TcpInTable};
use crate::tcp_out::TcpOutTable;
use crate::udp_nat::UdpNatTable;
use crate::wire::{self, ParsedFrame};
use crate::Result;
use smoltcp::wire::{EthernetAddress, EthernetFrame};
use std::net::Ipv4Addr;

pub struct Proxy {
    config: ProxyConfig,
    dhcp: DhcpServer,
    udp_nat: UdpNatTable,
    tcp_out: TcpOutTable,
    tcp_in: TcpInTable,
}

impl Proxy {
    /// `port_mappings` is fixed for the lifetime of this proxy; each binds a
    /// host listener immediately; a port already in use is an error.
    pub fn new(route_probe: Box<dyn RouteProbe>, port_mappings: Vec<PortMapping>) -> Result<Self> {
        Ok(Self {
            config: ProxyConfig::default(),
            dhcp: DhcpServer::new(route_probe),
            udp_nat: UdpNatTable::new(),
            tcp_out: TcpOutTable::new(),
            tcp_in: TcpInTable::new(port_mappings)?,
        })
    }

    /// Explicitly configure (or, with an unspecified `guest_ip`, disable)
    /// the guest-facing network. Disabling drops every in-flight UDP/TCP
    /// flow; DHCP auto-detect (§4.3) bypasses this entirely.
    pub fn configure(&mut self, guest_ip: Ipv4Addr, gateway_ip: Ipv4Addr, host_ip: Ipv4Addr) {
        self.config.configure(guest_ip, gateway_ip, host_ip);
        if !self.config.enabled {
            self.udp_nat = UdpNatTable::new();
            self.tcp_out = TcpOutTable::new();
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Entry point called by the NIC emulator for every frame the guest
    /// transmits. Implements the ordered dispatch fold from the Design
    /// Notes; any frame a later handler would also have claimed never
    /// reaches it once an earlier one does.
    pub fn tx_from_guest(&mut self, frame: &[u8], guest_io: &mut dyn GuestIo) -> Handled {
        // §4.7: poll runs inline on every guest submission in addition to
        // the wall-clock timer, so host-side progress isn't starved between
        // ticks under a bursty guest workload.
        self.poll(guest_io);

        match wire::parse(frame) {
            ParsedFrame::Arp { repr } => {
                if let Some(reply) = arp::handle_request(&repr, self.config.guest_ip) {
                    guest_io.rx_to_guest(&reply);
                }
                Handled::Arp
            }
            ParsedFrame::Ipv4Udp {
                ip,
                src_port,
                dst_port,
                payload,
            } => {
                if dst_port == dhcp::DHCP_SERVER_PORT {
                    let Ok(eth) = EthernetFrame::new_checked(frame) else {
                        return Handled::Fallthrough;
                    };
                    if let Some(reply) = self.dhcp.handle(payload, eth.src_addr(), &mut self.config) {
                        guest_io.rx_to_guest(&reply);
                    }
                    return Handled::Dhcp;
                }

                if !self.config.enabled {
                    return Handled::Fallthrough;
                }
                if self
                    .udp_nat
                    .send_outbound(&ip, src_port, dst_port, payload)
                    .is_err()
                {
                    tracing::debug!(dst_port, "dropping udp datagram, send_outbound failed");
                }
                Handled::Udp
            }
            ParsedFrame::Ipv4Tcp { ip, src_mac, tcp } => {
                if !self.config.enabled {
                    return Handled::Fallthrough;
                }
                self.config.guest_mac.get_or_insert(src_mac);

                if let Some(reply) = self.tcp_in.handle_guest_segment(
                    &tcp,
                    self.config.host_ip,
                    SYNTHETIC_HOST_MAC,
                    self.config.guest_ip,
                    src_mac,
                ) {
                    guest_io.rx_to_guest(&reply);
                    return Handled::InboundMatch;
                }

                if let Some(reply) = self.tcp_out.handle_guest_segment(&ip, &tcp, src_mac) {
                    guest_io.rx_to_guest(&reply);
                }
                Handled::Tcp
            }
            ParsedFrame::Other | ParsedFrame::NotMine => Handled::Fallthrough,
        }
    }

    /// Non-blockingly drain every host socket this proxy owns, delivering
    /// any resulting frames to the guest. Called once per emulator poll
    /// tick; never blocks, never recurses into `tx_from_guest`.
    pub fn poll(&mut self, guest_io: &mut dyn GuestIo) {
        if !self.config.enabled {
            return;
        }
        let guest_ip = self.config.guest_ip;
        let guest_mac = self
            .config
            .guest_mac
            .unwrap_or(EthernetAddress([0xff; 6]));
        let host_ip = self.config.host_ip;

        for frame in self
            .tcp_in
            .poll_accept(host_ip, SYNTHETIC_HOST_MAC, guest_ip, guest_mac)
        {
            guest_io.rx_to_guest(&frame);
        }
        for frame in self
            .tcp_in
            .poll_data(host_ip, SYNTHETIC_HOST_MAC, guest_ip, guest_mac)
        {
            guest_io.rx_to_guest(&frame);
        }
        for frame in self.tcp_out.poll(guest_ip, guest_mac) {
            guest_io.rx_to_guest(&frame);
        }
        for frame in self.udp_nat.poll(guest_ip, guest_mac) {
            guest_io.rx_to_guest(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_io::RecordingGuestIo;
    use crate::route_probe::DetectedRoute;
    use smoltcp::wire::{
        ArpOperation, ArpPacket, ArpRepr, EthernetProtocol, EthernetRepr, Ipv4Address,
    };

    struct FixedRouteProbe(DetectedRoute);
    impl RouteProbe for FixedRouteProbe {
        fn detect(&self) -> Option<DetectedRoute> {
            Some(self.0)
        }
    }

    fn arp_request(guest_mac: EthernetAddress, target_ip: Ipv4Addr) -> Vec<u8> {
        let arp_repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: guest_mac,
            source_protocol_addr: Ipv4Address::new(10, 0, 0, 5),
            target_hardware_addr: EthernetAddress::BROADCAST,
            target_protocol_addr: Ipv4Address::from(target_ip),
        };
        let mut frame = vec![0u8; 14 + arp_repr.buffer_len()];
        EthernetRepr {
            src_addr: guest_mac,
            dst_addr: EthernetAddress::BROADCAST,
            ethertype: EthernetProtocol::Arp,
        }
        .emit(&mut EthernetFrame::new_unchecked(&mut frame[..]));
        arp_repr.emit(&mut ArpPacket::new_unchecked(&mut frame[14..]));
        frame
    }

    #[test]
    fn arp_is_answered_regardless_of_proxy_configuration() {
        let probe = FixedRouteProbe(DetectedRoute {
            host_ip: Ipv4Addr::new(192, 168, 1, 1),
            gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
        });
        let mut proxy = Proxy::new(Box::new(probe), vec![]).unwrap();
        let mut guest_io = RecordingGuestIo::default();

        let guest_mac = EthernetAddress([0x02, 0, 0, 0, 0, 5]);
        let frame = arp_request(guest_mac, Ipv4Addr::new(10, 0, 0, 5));
        let handled = proxy.tx_from_guest(&frame, &mut guest_io);

        assert_eq!(handled, Handled::Arp);
        assert_eq!(guest_io.delivered.len(), 1);
    }

    #[test]
    fn udp_before_configuration_is_dropped() {
        let probe = FixedRouteProbe(DetectedRoute {
            host_ip: Ipv4Addr::new(192, 168, 1, 1),
            gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
        });
        let mut proxy = Proxy::new(Box::new(probe), vec![]).unwrap();
        let mut guest_io = RecordingGuestIo::default();

        let frame = wire::build_udp_frame(
            EthernetAddress([0x02, 0, 0, 0, 0, 5]),
            SYNTHETIC_HOST_MAC,
            std::net::SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 5000),
            std::net::SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
            b"",
        );
        let handled = proxy.tx_from_guest(&frame, &mut guest_io);
        assert_eq!(handled, Handled::Fallthrough);
    }
}
