//! UDP NAT table (§4.4).
//!
//! Every guest-originated UDP datagram (other than DHCP, which the DHCP
//! server owns) opens or reuses a host-side [`UdpSocket`] keyed by
//! `(guest_port, remote_ip, remote_port)`. The table is bounded at
//! [`MAX_ENTRIES`] flows; once full, new flows are silently dropped rather
//! than evicting an existing one. Idle flows — no traffic in either
//! direction for [`IDLE_TIMEOUT`] — are reclaimed lazily, scanned on every
//! lookup rather than by a background timer, matching the synchronous,
//! single poll-loop model the rest of this core follows.

use crate::config::SYNTHETIC_HOST_MAC;
use crate::wire;
use smoltcp::wire::{EthernetAddress, Ipv4Repr};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

pub const MAX_ENTRIES: usize = 32;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DHCP_SERVER_PORT: u16 = 67;

#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
pub struct FlowKey {
    pub guest_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

struct Flow {
    socket: UdpSocket,
    last_active: Instant,
}

#[derive(Default)]
pub struct UdpNatTable {
    flows: HashMap<FlowKey, Flow>,
}

impl UdpNatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Forward one guest-originated datagram to its destination, opening a
    /// new flow if none exists yet.
    pub fn send_outbound(
        &mut self,
        ip: &Ipv4Repr,
        guest_port: u16,
        remote_port: u16,
        payload: &[u8],
    ) -> std::io::Result<()> {
        if remote_port == DHCP_SERVER_PORT {
            return Ok(());
        }

        self.evict_idle();

        let key = FlowKey {
            guest_port,
            remote_ip: ip.dst_addr.into(),
            remote_port,
        };

        if !self.flows.contains_key(&key) {
            if self.flows.len() >= MAX_ENTRIES {
                tracing::warn!(?key, "udp nat table full, dropping new flow");
                return Ok(());
            }
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.set_nonblocking(true)?;
            self.flows.insert(
                key,
                Flow {
                    socket,
                    last_active: Instant::now(),
                },
            );
        }

        let flow = self.flows.get_mut(&key).expect("just inserted or present");
        flow.socket
            .send_to(payload, SocketAddrV4::new(key.remote_ip, key.remote_port))?;
        flow.last_active = Instant::now();
        Ok(())
    }

    /// Drain every open flow's socket non-blockingly, synthesizing a frame
    /// toward the guest for each datagram received.
    pub fn poll(&mut self, guest_ip: Ipv4Addr, guest_mac: EthernetAddress) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut buf = [0u8; 65536];

        for (key, flow) in self.flows.iter_mut() {
            loop {
                match flow.socket.recv_from(&mut buf) {
                    Ok((n, _from)) => {
                        flow.last_active = Instant::now();
                        let src = SocketAddrV4::new(key.remote_ip, key.remote_port);
                        let dst = SocketAddrV4::new(guest_ip, key.guest_port);
                        frames.push(wire::build_udp_frame(
                            SYNTHETIC_HOST_MAC,
                            guest_mac,
                            src,
                            dst,
                            &buf[..n],
                        ));
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }

        frames
    }

    fn evict_idle(&mut self) {
        let now = Instant::now();
        self.flows
            .retain(|_, flow| now.duration_since(flow.last_active) < IDLE_TIMEOUT);
    }
}
