//! Outbound TCP engine (§4.5): the guest opens a connection, this proxy
//! terminates it against a real host socket and synthesizes the guest-facing
//! side of the handshake by hand — there is no `smoltcp::socket::tcp`
//! instance backing either end, just `seq_out`/`ack_out` counters the way
//! the lineage's `port_forward.rs` tracks `our_seq`/`guest_next_seq` for its
//! (reversed-direction) inbound connections.
//!
//! The guest's SYN gets an immediate synthesized SYN-ACK; the host-side
//! `connect()` runs concurrently and non-blocking, so the two are not
//! sequenced. There is no retransmission and no window scaling: a stalled
//! connection just sits idle until one side tears it down.

use crate::config::SYNTHETIC_HOST_MAC;
use crate::wire::{self, TcpSegment};
use smoltcp::wire::{EthernetAddress, Ipv4Repr, TcpControl, TcpRepr};
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const MAX_ENTRIES: usize = 64;
pub const MSS: u16 = 1460;

#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
pub struct FlowKey {
    pub guest_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum State {
    SynSent,
    Established,
    Closed,
}

struct Flow {
    socket: Socket,
    state: State,
    seq_out: u32,
    ack_out: u32,
}

#[derive(Default)]
pub struct TcpOutTable {
    flows: HashMap<FlowKey, Flow>,
}

/// `None` while the connect is still in progress, `Some(true)` once it
/// succeeded, `Some(false)` on a hard failure — checked the SO_ERROR /
/// getpeername way a plain non-blocking-sockets core would, since nothing
/// here pulls in an epoll/kqueue multiplexer.
fn connect_outcome(socket: &Socket) -> Option<bool> {
    match socket.take_error() {
        Ok(Some(_)) => Some(false),
        Err(_) => Some(false),
        Ok(None) => match socket.peer_addr() {
            Ok(_) => Some(true),
            Err(ref e) if e.kind() == ErrorKind::NotConnected => None,
            Err(_) => Some(false),
        },
    }
}

impl TcpOutTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Handle one guest-originated segment, opening a new flow on an
    /// unattached SYN. Returns the synthesized segment to deliver back to
    /// the guest, if any.
    pub fn handle_guest_segment(
        &mut self,
        ip: &Ipv4Repr,
        tcp: &TcpRepr<'_>,
        guest_mac: EthernetAddress,
    ) -> Option<Vec<u8>> {
        let key = FlowKey {
            guest_port: tcp.src_port,
            remote_ip: ip.dst_addr.into(),
            remote_port: tcp.dst_port,
        };

        if tcp.control == TcpControl::Syn && tcp.ack_number.is_none() {
            return self.open(key, tcp, ip.src_addr.into(), guest_mac);
        }

        let flow = self.flows.get_mut(&key)?;

        match flow.state {
            State::SynSent => {
                if tcp.control == TcpControl::None {
                    flow.state = State::Established;
                }
                None
            }
            State::Established => {
                if !tcp.payload.is_empty() {
                    if flow.socket.write_all(tcp.payload).is_err() {
                        flow.state = State::Closed;
                        return None;
                    }
                    // recomputed absolute, not accumulated, so a guest
                    // retransmission re-acks the same bytes instead of
                    // double-counting them.
                    flow.ack_out = (tcp.seq_number.0 as u32).wrapping_add(tcp.payload.len() as u32);
                }
                if tcp.control == TcpControl::Fin {
                    flow.ack_out = flow.ack_out.wrapping_add(1);
                    let frame = wire::build_tcp_frame(
                        SYNTHETIC_HOST_MAC,
                        guest_mac,
                        TcpSegment {
                            src: SocketAddrV4::new(key.remote_ip, key.remote_port),
                            dst: SocketAddrV4::new(ip.src_addr.into(), key.guest_port),
                            seq: flow.seq_out,
                            ack: flow.ack_out,
                            control: TcpControl::Fin,
                            max_seg_size: None,
                            payload: &[],
                        },
                    );
                    flow.seq_out = flow.seq_out.wrapping_add(1);
                    flow.state = State::Closed;
                    let _ = flow.socket.shutdown(std::net::Shutdown::Both);
                    return Some(frame);
                }
                if !tcp.payload.is_empty() {
                    return Some(wire::build_tcp_frame(
                        SYNTHETIC_HOST_MAC,
                        guest_mac,
                        TcpSegment {
                            src: SocketAddrV4::new(key.remote_ip, key.remote_port),
                            dst: SocketAddrV4::new(ip.src_addr.into(), key.guest_port),
                            seq: flow.seq_out,
                            ack: flow.ack_out,
                            control: TcpControl::None,
                            max_seg_size: None,
                            payload: &[],
                        },
                    ));
                }
                None
            }
            State::Closed => None,
        }
    }

    fn open(
        &mut self,
        key: FlowKey,
        tcp: &TcpRepr<'_>,
        guest_ip: Ipv4Addr,
        guest_mac: EthernetAddress,
    ) -> Option<Vec<u8>> {
        if self.flows.contains_key(&key) {
            return None;
        }
        if self.flows.len() >= MAX_ENTRIES {
            tracing::warn!(?key, "outbound tcp table full, dropping new flow");
            return None;
        }

        let socket = match Socket::new(Domain::IPV4, Type::STREAM, None) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(?key, error = %e, "failed to create outbound tcp socket");
                return None;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            tracing::warn!(?key, error = %e, "failed to set outbound tcp socket nonblocking");
            return None;
        }
        let remote: SocketAddr = SocketAddrV4::new(key.remote_ip, key.remote_port).into();
        // A nonblocking connect reports in-progress as WouldBlock/EINPROGRESS;
        // the real outcome is polled for later rather than awaited here.
        let _ = socket.connect(&remote.into());

        let seq_out: u32 = rand::random();
        let ack_out = (tcp.seq_number.0 as u32).wrapping_add(1);

        let frame = wire::build_tcp_frame(
            SYNTHETIC_HOST_MAC,
            guest_mac,
            TcpSegment {
                src: SocketAddrV4::new(key.remote_ip, key.remote_port),
                dst: SocketAddrV4::new(guest_ip, key.guest_port),
                seq: seq_out,
                ack: ack_out,
                control: TcpControl::Syn,
                max_seg_size: Some(MSS),
                payload: &[],
            },
        );

        self.flows.insert(
            key,
            Flow {
                socket,
                state: State::SynSent,
                seq_out: seq_out.wrapping_add(1),
                ack_out,
            },
        );

        Some(frame)
    }

    /// Drain established flows' host sockets and detect dead connects,
    /// non-blockingly, synthesizing the guest-facing segments each produces.
    pub fn poll(&mut self, guest_ip: Ipv4Addr, guest_mac: EthernetAddress) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut buf = [0u8; MSS as usize];

        for (key, flow) in self.flows.iter_mut() {
            if flow.state == State::Closed {
                continue;
            }
            if connect_outcome(&flow.socket) == Some(false) {
                frames.push(wire::build_tcp_frame(
                    SYNTHETIC_HOST_MAC,
                    guest_mac,
                    TcpSegment {
                        src: SocketAddrV4::new(key.remote_ip, key.remote_port),
                        dst: SocketAddrV4::new(guest_ip, key.guest_port),
                        seq: flow.seq_out,
                        ack: flow.ack_out,
                        control: TcpControl::Fin,
                        max_seg_size: None,
                        payload: &[],
                    },
                ));
                flow.seq_out = flow.seq_out.wrapping_add(1);
                flow.state = State::Closed;
                continue;
            }

            if flow.state != State::Established {
                continue;
            }

            loop {
                match flow.socket.read(&mut buf) {
                    Ok(0) => {
                        frames.push(wire::build_tcp_frame(
                            SYNTHETIC_HOST_MAC,
                            guest_mac,
                            TcpSegment {
                                src: SocketAddrV4::new(key.remote_ip, key.remote_port),
                                dst: SocketAddrV4::new(guest_ip, key.guest_port),
                                seq: flow.seq_out,
                                ack: flow.ack_out,
                                control: TcpControl::Fin,
                                max_seg_size: None,
                                payload: &[],
                            },
                        ));
                        flow.seq_out = flow.seq_out.wrapping_add(1);
                        flow.state = State::Closed;
                        break;
                    }
                    Ok(n) => {
                        frames.push(wire::build_tcp_frame(
                            SYNTHETIC_HOST_MAC,
                            guest_mac,
                            TcpSegment {
                                src: SocketAddrV4::new(key.remote_ip, key.remote_port),
                                dst: SocketAddrV4::new(guest_ip, key.guest_port),
                                seq: flow.seq_out,
                                ack: flow.ack_out,
                                control: TcpControl::Psh,
                                max_seg_size: None,
                                payload: &buf[..n],
                            },
                        ));
                        flow.seq_out = flow.seq_out.wrapping_add(n as u32);
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        flow.state = State::Closed;
                        break;
                    }
                }
            }
        }

        self.flows.retain(|_, flow| flow.state != State::Closed);
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{IpProtocol, Ipv4Address, TcpSeqNumber};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn ip_repr(dst: Ipv4Addr) -> Ipv4Repr {
        Ipv4Repr {
            src_addr: Ipv4Address::new(10, 0, 0, 5),
            dst_addr: Ipv4Address::from(dst),
            next_header: IpProtocol::Tcp,
            payload_len: 0,
            hop_limit: 64,
        }
    }

    fn syn(src_port: u16, dst_port: u16, seq: u32) -> TcpRepr<'static> {
        TcpRepr {
            src_port,
            dst_port,
            seq_number: TcpSeqNumber(seq as i32),
            ack_number: None,
            window_len: 65535,
            window_scale: None,
            control: TcpControl::Syn,
            max_seg_size: Some(1460),
            sack_permitted: false,
            sack_ranges: [None, None, None],
            timestamp: None,
            payload: &[],
        }
    }

    #[test]
    fn guest_syn_gets_immediate_synthesized_syn_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let guest_mac = EthernetAddress([0x52, 0x54, 0, 0, 0, 2]);

        let mut table = TcpOutTable::new();
        let ip = ip_repr(*addr.ip());
        let tcp = syn(40000, addr.port(), 1000);
        let frame = table
            .handle_guest_segment(&ip, &tcp, guest_mac)
            .expect("SYN should get an immediate SYN-ACK");

        let eth = smoltcp::wire::EthernetFrame::new_checked(&frame).unwrap();
        let ip_pkt = smoltcp::wire::Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp_pkt = smoltcp::wire::TcpPacket::new_checked(ip_pkt.payload()).unwrap();
        assert!(tcp_pkt.syn());
        assert!(tcp_pkt.ack());
        assert_eq!(tcp_pkt.ack_number(), TcpSeqNumber(1001));
        assert_eq!(tcp_pkt.src_port(), addr.port());
        assert_eq!(tcp_pkt.dst_port(), 40000);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn established_flow_drains_remote_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"hi from remote").unwrap();
        });

        let mut table = TcpOutTable::new();
        let ip = ip_repr(*addr.ip());
        let tcp = syn(40000, addr.port(), 1000);
        let guest_mac = EthernetAddress([0x52, 0x54, 0, 0, 0, 2]);
        table.handle_guest_segment(&ip, &tcp, guest_mac);

        // guest ACKs the SYN-ACK
        let ack = TcpRepr {
            control: TcpControl::None,
            ack_number: Some(TcpSeqNumber(1)),
            ..syn(40000, addr.port(), 1001)
        };
        table.handle_guest_segment(&ip, &ack, guest_mac);

        server.join().unwrap();

        let guest_ip = Ipv4Addr::new(10, 0, 0, 5);
        let mut data_frames = Vec::new();
        for _ in 0..50 {
            let frames = table.poll(guest_ip, guest_mac);
            if !frames.is_empty() {
                data_frames = frames;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!data_frames.is_empty());
    }

    #[test]
    fn guest_payload_is_forwarded_and_acked() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            buf[..n].to_vec()
        });

        let mut table = TcpOutTable::new();
        let ip = ip_repr(*addr.ip());
        let tcp = syn(40000, addr.port(), 1000);
        let guest_mac = EthernetAddress([0x52, 0x54, 0, 0, 0, 2]);
        table.handle_guest_segment(&ip, &tcp, guest_mac);

        let ack = TcpRepr {
            control: TcpControl::None,
            ack_number: Some(TcpSeqNumber(1)),
            ..syn(40000, addr.port(), 1001)
        };
        table.handle_guest_segment(&ip, &ack, guest_mac);

        let data = TcpRepr {
            control: TcpControl::None,
            ack_number: Some(TcpSeqNumber(1)),
            payload: b"GET / HTTP/1.0\r\n\r\n",
            ..syn(40000, addr.port(), 1001)
        };
        let reply = table
            .handle_guest_segment(&ip, &data, guest_mac)
            .expect("a guest payload segment should get an ACK back");

        let received = server.join().unwrap();
        assert_eq!(received, b"GET / HTTP/1.0\r\n\r\n");

        let eth = smoltcp::wire::EthernetFrame::new_checked(&reply).unwrap();
        let ip_pkt = smoltcp::wire::Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp_pkt = smoltcp::wire::TcpPacket::new_checked(ip_pkt.payload()).unwrap();
        assert!(!tcp_pkt.syn());
        assert!(!tcp_pkt.fin());
        assert!(tcp_pkt.ack());
        assert_eq!(
            tcp_pkt.ack_number(),
            TcpSeqNumber(1001_i32.wrapping_add(18))
        );
    }

    #[test]
    fn table_full_drops_new_connection() {
        let mut table = TcpOutTable::new();
        let guest_mac = EthernetAddress([0x52, 0x54, 0, 0, 0, 2]);
        for i in 0..MAX_ENTRIES {
            let ip = ip_repr(Ipv4Addr::new(93, 184, 216, (i + 1) as u8));
            let tcp = syn(30000 + i as u16, 80, 1);
            assert!(table.handle_guest_segment(&ip, &tcp, guest_mac).is_some());
        }
        assert_eq!(table.len(), MAX_ENTRIES);

        let ip = ip_repr(Ipv4Addr::new(93, 184, 216, 250));
        let tcp = syn(31000, 80, 1);
        assert!(table.handle_guest_segment(&ip, &tcp, guest_mac).is_none());
        assert_eq!(table.len(), MAX_ENTRIES);
    }
}
