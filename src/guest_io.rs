//! The boundary between this core and the NIC emulator (§4.8).
//!
//! Unlike the lineage's [`FrameIO`](https://docs.rs/smoltcp)-style poll-based
//! transport abstraction, the guest side here is a push boundary: the
//! emulator calls [`Proxy::tx_from_guest`](crate::Proxy::tx_from_guest) for
//! every guest-transmitted frame, and this core calls back into
//! [`GuestIo::rx_to_guest`] synchronously whenever it has a frame to deliver.
//! There is no polling on this side; non-blocking drain only happens against
//! host sockets (see [`crate::poll`]).

/// Implemented by the NIC emulator. Called by this core whenever a
/// synthesized frame needs to reach the guest's receive ring.
pub trait GuestIo {
    /// Deliver one Ethernet frame to the guest.
    ///
    /// Returns `true` if the guest's receive ring accepted the frame, `false`
    /// if there was no descriptor available. A `false` return means the
    /// frame is simply dropped; there is no retry queue (§7).
    fn rx_to_guest(&mut self, frame: &[u8]) -> bool;
}

/// Test/demo double that records every frame handed to it instead of
/// delivering it anywhere.
#[derive(Default)]
pub struct RecordingGuestIo {
    pub delivered: Vec<Vec<u8>>,
}

impl GuestIo for RecordingGuestIo {
    fn rx_to_guest(&mut self, frame: &[u8]) -> bool {
        self.delivered.push(frame.to_vec());
        true
    }
}

/// Test double simulating a guest whose receive ring never has room.
#[derive(Default)]
pub struct FullRingGuestIo;

impl GuestIo for FullRingGuestIo {
    fn rx_to_guest(&mut self, _frame: &[u8]) -> bool {
        false
    }
}
