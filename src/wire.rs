//! Frame codec (§4.1): zero-copy parse/build for the handful of protocols
//! this proxy speaks, built directly on `smoltcp::wire`'s `*Packet`/`*Repr`
//! types the way the lineage's `nat.rs`/`port_forward.rs` craft frames —
//! `smoltcp` already gives byte-wise, alignment-free parsing and recomputes
//! IPv4/TCP/UDP one's-complement checksums on `emit`, so there is no
//! hand-rolled checksum routine here; keeping that dependency is the "keep
//! the wire layer where the lineage keeps it" call recorded in DESIGN.md.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr,
    TcpSeqNumber, UdpPacket, UdpRepr,
};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_MIN_HEADER_LEN: usize = 20;

fn checksum_caps() -> ChecksumCapabilities {
    ChecksumCapabilities::default()
}

/// What a frame submitted by the guest turned out to be, for the ordered
/// dispatch fold described in DESIGN.md ("Polymorphic frame dispatch").
pub enum ParsedFrame<'a> {
    Arp {
        repr: ArpRepr,
    },
    Ipv4Udp {
        ip: Ipv4Repr,
        src_port: u16,
        dst_port: u16,
        payload: &'a [u8],
    },
    Ipv4Tcp {
        ip: Ipv4Repr,
        src_mac: EthernetAddress,
        tcp: TcpRepr<'a>,
    },
    /// Parsed, but not a protocol this proxy handles (e.g. ICMP): the
    /// dispatcher falls through silently.
    Other,
    /// Too short or otherwise malformed; parser returns "not mine" per the
    /// edge-case policy in §4.1 rather than an error.
    NotMine,
}

/// Classify one guest-submitted Ethernet frame.
pub fn parse(frame: &[u8]) -> ParsedFrame<'_> {
    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return ParsedFrame::NotMine;
    };

    match eth.ethertype() {
        EthernetProtocol::Arp => match ArpPacket::new_checked(eth.payload()) {
            Ok(pkt) => match ArpRepr::parse(&pkt) {
                Ok(repr) => ParsedFrame::Arp { repr },
                Err(_) => ParsedFrame::NotMine,
            },
            Err(_) => ParsedFrame::NotMine,
        },
        EthernetProtocol::Ipv4 => {
            let Ok(ip_packet) = Ipv4Packet::new_checked(eth.payload()) else {
                return ParsedFrame::NotMine;
            };
            let Ok(ip_repr) = Ipv4Repr::parse(&ip_packet, &checksum_caps()) else {
                return ParsedFrame::NotMine;
            };

            match ip_packet.next_header() {
                IpProtocol::Udp => {
                    let Ok(udp_packet) = UdpPacket::new_checked(ip_packet.payload()) else {
                        return ParsedFrame::NotMine;
                    };
                    ParsedFrame::Ipv4Udp {
                        ip: ip_repr,
                        src_port: udp_packet.src_port(),
                        dst_port: udp_packet.dst_port(),
                        payload: udp_packet.payload(),
                    }
                }
                IpProtocol::Tcp => {
                    let Ok(tcp_packet) = TcpPacket::new_checked(ip_packet.payload()) else {
                        return ParsedFrame::NotMine;
                    };
                    let Ok(tcp_repr) =
                        TcpRepr::parse(&tcp_packet, &ip_repr.src_addr.into(), &ip_repr.dst_addr.into(), &checksum_caps())
                    else {
                        return ParsedFrame::NotMine;
                    };
                    ParsedFrame::Ipv4Tcp {
                        ip: ip_repr,
                        src_mac: eth.src_addr(),
                        tcp: tcp_repr,
                    }
                }
                _ => ParsedFrame::Other,
            }
        }
        _ => ParsedFrame::Other,
    }
}

/// Build a 42-byte ARP reply announcing `sender_mac` as the owner of
/// `sender_ip`, addressed back to `(target_mac, target_ip)` (§4.2).
pub fn build_arp_reply(
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_mac: EthernetAddress,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: sender_mac,
        source_protocol_addr: Ipv4Address::from(sender_ip),
        target_hardware_addr: target_mac,
        target_protocol_addr: Ipv4Address::from(target_ip),
    };

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + arp_repr.buffer_len()];
    let eth_repr = EthernetRepr {
        src_addr: sender_mac,
        dst_addr: target_mac,
        ethertype: EthernetProtocol::Arp,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let mut arp_packet = ArpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    arp_repr.emit(&mut arp_packet);

    frame
}

/// Build an Ethernet/IPv4/UDP frame carrying `payload` from `src` to `dst`.
pub fn build_udp_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let ip_len = IPV4_MIN_HEADER_LEN + udp_len;
    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + ip_len];

    let eth_repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from(*src.ip()),
        dst_addr: Ipv4Address::from(*dst.ip()),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let caps = checksum_caps();
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    ip_repr.emit(&mut ip_packet, &caps);

    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let mut udp_packet =
        UdpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV4_MIN_HEADER_LEN..]);
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &caps,
    );

    frame
}

/// Everything needed to emit one synthesized TCP segment toward the guest
/// (§4.5/§4.6): the proxy always plays the server role on this side, so
/// `control`/`ack_number`/`max_seg_size` cover every segment kind emitted —
/// SYN-ACK, plain ACK, PSH-ACK, and FIN-ACK.
pub struct TcpSegment<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub control: TcpControl,
    pub max_seg_size: Option<u16>,
    pub payload: &'a [u8],
}

pub fn build_tcp_frame(src_mac: EthernetAddress, dst_mac: EthernetAddress, seg: TcpSegment<'_>) -> Vec<u8> {
    let tcp_repr = TcpRepr {
        src_port: seg.src.port(),
        dst_port: seg.dst.port(),
        seq_number: TcpSeqNumber(seg.seq as i32),
        ack_number: Some(TcpSeqNumber(seg.ack as i32)),
        window_len: 0xFFFF,
        window_scale: None,
        control: seg.control,
        max_seg_size: seg.max_seg_size,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        timestamp: None,
        payload: seg.payload,
    };

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from(*seg.src.ip()),
        dst_addr: Ipv4Address::from(*seg.dst.ip()),
        next_header: IpProtocol::Tcp,
        payload_len: tcp_repr.buffer_len(),
        hop_limit: 64,
    };

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + IPV4_MIN_HEADER_LEN + tcp_repr.buffer_len()];

    let eth_repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let caps = checksum_caps();
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    ip_repr.emit(&mut ip_packet, &caps);

    let mut tcp_packet =
        TcpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV4_MIN_HEADER_LEN..]);
    tcp_repr.emit(
        &mut tcp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        &caps,
    );

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arp_reply_is_42_bytes_and_checksums() {
        let sender_mac = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x01]);
        let target_mac = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let frame = build_arp_reply(
            sender_mac,
            Ipv4Addr::new(10, 0, 0, 1),
            target_mac,
            Ipv4Addr::new(10, 0, 0, 5),
        );
        assert_eq!(frame.len(), 42);

        let eth = EthernetFrame::new_checked(&frame).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
        let arp = ArpPacket::new_checked(eth.payload()).unwrap();
        let repr = ArpRepr::parse(&arp).unwrap();
        match repr {
            ArpRepr::EthernetIpv4 {
                operation,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } => {
                assert_eq!(operation, ArpOperation::Reply);
                assert_eq!(source_protocol_addr, Ipv4Address::new(10, 0, 0, 1));
                assert_eq!(target_protocol_addr, Ipv4Address::new(10, 0, 0, 5));
            }
            _ => panic!("wrong arp repr variant"),
        }
    }

    #[test]
    fn udp_frame_round_trips_and_checksums() {
        let src_mac = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x01]);
        let dst_mac = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x02]);
        let src = SocketAddrV4::new(Ipv4Addr::new(8, 8, 4, 4), 7);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 5000);
        let frame = build_udp_frame(src_mac, dst_mac, src, dst, b"PONG");

        let eth = EthernetFrame::new_checked(&frame).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(Ipv4Repr::parse(&ip, &checksum_caps()).is_ok());
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert!(udp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into()));
        assert_eq!(udp.payload(), b"PONG");
    }

    #[test]
    fn tcp_syn_ack_carries_mss_and_checksums() {
        let src_mac = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x01]);
        let dst_mac = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x02]);
        let seg = TcpSegment {
            src: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 80),
            dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 40000),
            seq: 1000,
            ack: 5001,
            control: TcpControl::Syn,
            max_seg_size: Some(1460),
            payload: &[],
        };
        let frame = build_tcp_frame(src_mac, dst_mac, seg);

        let eth = EthernetFrame::new_checked(&frame).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.syn());
        assert!(tcp.ack());
        assert_eq!(tcp.ack_number(), TcpSeqNumber(5001));
        assert_eq!(tcp.max_seg_size(), Some(1460));
        assert!(tcp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into()));
    }
}
