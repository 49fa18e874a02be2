//! Inbound TCP engine (§4.6): host-initiated connections forwarded to a
//! fixed guest port, the mirror image of [`crate::tcp_out`] and grounded the
//! same way the lineage's `port_forward.rs` forwards host listeners to the
//! guest — a virtual source port stands in for the host client, and the
//! handshake toward the guest is synthesized by hand since the guest is the
//! one playing server here.
//!
//! The port map is fixed at construction (`host_port -> guest_port`), not
//! learned or negotiated; a guest service is only reachable if its mapping
//! was configured up front.

use crate::wire::{self, TcpSegment};
use smoltcp::wire::{EthernetAddress, Ipv4Repr, TcpControl, TcpRepr};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};

pub const MAX_ENTRIES: usize = 8;
const MSS: u16 = crate::tcp_out::MSS;

#[derive(Clone, Copy, Debug)]
pub struct PortMapping {
    pub host_port: u16,
    pub guest_port: u16,
}

#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
struct ConnKey {
    virtual_port: u16,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum State {
    SynSentToGuest,
    Established,
    Closed,
}

struct Conn {
    stream: TcpStream,
    guest_port: u16,
    state: State,
    seq_out: u32,
    ack_out: u32,
}

pub struct TcpInTable {
    mappings: Vec<PortMapping>,
    listeners: Vec<TcpListener>,
    conns: HashMap<ConnKey, Conn>,
}

impl TcpInTable {
    pub fn new(mappings: Vec<PortMapping>) -> std::io::Result<Self> {
        let mut listeners = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            let listener = TcpListener::bind(("127.0.0.1", mapping.host_port))?;
            listener.set_nonblocking(true)?;
            listeners.push(listener);
        }
        Ok(Self {
            mappings,
            listeners,
            conns: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Accept any pending host connections and synthesize the SYN each opens
    /// toward the guest.
    pub fn poll_accept(
        &mut self,
        host_ip: Ipv4Addr,
        host_mac: EthernetAddress,
        guest_ip: Ipv4Addr,
        guest_mac: EthernetAddress,
    ) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for (listener, mapping) in self.listeners.iter().zip(self.mappings.iter()) {
            loop {
                let (stream, client_addr) = match listener.accept() {
                    Ok(pair) => pair,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::warn!(host_port = mapping.host_port, error = %e, "accept failed");
                        break;
                    }
                };

                if self.conns.len() >= MAX_ENTRIES {
                    tracing::warn!(
                        host_port = mapping.host_port,
                        "inbound tcp table full, refusing connection"
                    );
                    drop(stream);
                    continue;
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    tracing::warn!(error = %e, "failed to set inbound tcp stream nonblocking");
                    continue;
                }

                let virtual_port = (client_addr.port() % 16384) + 49152;
                let seq_out: u32 = rand::random();
                self.conns.insert(
                    ConnKey { virtual_port },
                    Conn {
                        stream,
                        guest_port: mapping.guest_port,
                        state: State::SynSentToGuest,
                        seq_out,
                        ack_out: 0,
                    },
                );

                frames.push(wire::build_tcp_frame(
                    host_mac,
                    guest_mac,
                    TcpSegment {
                        src: SocketAddrV4::new(host_ip, virtual_port),
                        dst: SocketAddrV4::new(guest_ip, mapping.guest_port),
                        seq: seq_out,
                        ack: 0,
                        control: TcpControl::Syn,
                        max_seg_size: Some(MSS),
                        payload: &[],
                    },
                ));
            }
        }

        frames
    }

    /// Handle a guest-originated segment addressed to one of our virtual
    /// ports (the guest's reply in a host-initiated connection).
    pub fn handle_guest_segment(
        &mut self,
        tcp: &TcpRepr<'_>,
        host_ip: Ipv4Addr,
        host_mac: EthernetAddress,
        guest_ip: Ipv4Addr,
        guest_mac: EthernetAddress,
    ) -> Option<Vec<u8>> {
        let key = ConnKey {
            virtual_port: tcp.dst_port,
        };
        let conn = self.conns.get_mut(&key)?;

        match conn.state {
            State::SynSentToGuest => {
                if tcp.control == TcpControl::Syn && tcp.ack_number.is_some() {
                    conn.ack_out = (tcp.seq_number.0 as u32).wrapping_add(1);
                    conn.seq_out = conn.seq_out.wrapping_add(1);
                    conn.state = State::Established;
                    Some(wire::build_tcp_frame(
                        host_mac,
                        guest_mac,
                        TcpSegment {
                            src: SocketAddrV4::new(host_ip, key.virtual_port),
                            dst: SocketAddrV4::new(guest_ip, conn.guest_port),
                            seq: conn.seq_out,
                            ack: conn.ack_out,
                            control: TcpControl::None,
                            max_seg_size: None,
                            payload: &[],
                        },
                    ))
                } else {
                    None
                }
            }
            State::Established => {
                if !tcp.payload.is_empty() {
                    if conn.stream.write_all(tcp.payload).is_err() {
                        conn.state = State::Closed;
                        return None;
                    }
                    // recomputed absolute so a guest retransmission re-acks
                    // the same bytes instead of double-counting them.
                    conn.ack_out = (tcp.seq_number.0 as u32).wrapping_add(tcp.payload.len() as u32);
                }
                if tcp.control == TcpControl::Fin {
                    let _ = conn.stream.shutdown(std::net::Shutdown::Write);
                    conn.ack_out = conn.ack_out.wrapping_add(1);
                    return Some(wire::build_tcp_frame(
                        host_mac,
                        guest_mac,
                        TcpSegment {
                            src: SocketAddrV4::new(host_ip, key.virtual_port),
                            dst: SocketAddrV4::new(guest_ip, conn.guest_port),
                            seq: conn.seq_out,
                            ack: conn.ack_out,
                            control: TcpControl::None,
                            max_seg_size: None,
                            payload: &[],
                        },
                    ));
                }
                if !tcp.payload.is_empty() {
                    return Some(wire::build_tcp_frame(
                        host_mac,
                        guest_mac,
                        TcpSegment {
                            src: SocketAddrV4::new(host_ip, key.virtual_port),
                            dst: SocketAddrV4::new(guest_ip, conn.guest_port),
                            seq: conn.seq_out,
                            ack: conn.ack_out,
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

    /// Drain established connections' host sockets non-blockingly.
    pub fn poll_data(
        &mut self,
        host_ip: Ipv4Addr,
        host_mac: EthernetAddress,
        guest_ip: Ipv4Addr,
        guest_mac: EthernetAddress,
    ) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut buf = [0u8; MSS as usize];

        for (key, conn) in self.conns.iter_mut() {
            if conn.state != State::Established {
                continue;
            }
            loop {
                match conn.stream.read(&mut buf) {
                    Ok(0) => {
                        frames.push(wire::build_tcp_frame(
                            host_mac,
                            guest_mac,
                            TcpSegment {
                                src: SocketAddrV4::new(host_ip, key.virtual_port),
                                dst: SocketAddrV4::new(guest_ip, conn.guest_port),
                                seq: conn.seq_out,
                                ack: conn.ack_out,
                                control: TcpControl::Fin,
                                max_seg_size: None,
                                payload: &[],
                            },
                        ));
                        conn.seq_out = conn.seq_out.wrapping_add(1);
                        conn.state = State::Closed;
                        break;
                    }
                    Ok(n) => {
                        frames.push(wire::build_tcp_frame(
                            host_mac,
                            guest_mac,
                            TcpSegment {
                                src: SocketAddrV4::new(host_ip, key.virtual_port),
                                dst: SocketAddrV4::new(guest_ip, conn.guest_port),
                                seq: conn.seq_out,
                                ack: conn.ack_out,
                                control: TcpControl::Psh,
                                max_seg_size: None,
                                payload: &buf[..n],
                            },
                        ));
                        conn.seq_out = conn.seq_out.wrapping_add(n as u32);
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        conn.state = State::Closed;
                        break;
                    }
                }
            }
        }

        self.conns.retain(|_, conn| conn.state != State::Closed);
        frames
    }
}
