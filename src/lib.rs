//! Userspace network proxy that half-terminates an emulated guest's
//! TCP/IP stack against host sockets: no virtual switch, no bridging, no
//! full guest-side TCP/IP stack — one guest, one `Proxy`, one poll loop.

mod arp;
mod config;
mod dhcp;
mod dispatch;
mod error;
mod guest_io;
mod proxy;
mod route_probe;
mod tcp_in;
mod tcp_out;
mod udp_nat;
mod wire;

pub use config::{ProxyConfig, LEASE_SECONDS, SYNTHETIC_HOST_MAC};
pub use dispatch::Handled;
pub use error::{ProxyError, Result};
pub use guest_io::{FullRingGuestIo, GuestIo, RecordingGuestIo};
pub use proxy::Proxy;
pub use route_probe::{derive_guest_ip, DetectedRoute, RouteProbe, SystemRouteProbe};
pub use tcp_in::PortMapping;
