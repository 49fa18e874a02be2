//! ARP responder (§4.2).
//!
//! Answers every ARP request for an IPv4 address other than the guest's own
//! (that case is the guest's duplicate-address-detection probe and is
//! silently consumed, never answered) by claiming `SYNTHETIC_HOST_MAC` as the
//! owner. There is no ARP table on the host side: every address the guest
//! might ever ARP for — gateway, DNS, any NAT'd remote — is proxied behind
//! the one synthetic MAC, so every reply is built the same way regardless of
//! which address was asked for.

use crate::config::SYNTHETIC_HOST_MAC;
use crate::wire;
use smoltcp::wire::{ArpOperation, ArpRepr, EthernetAddress};
use std::net::Ipv4Addr;

/// Handle one parsed ARP packet arriving from the guest.
///
/// Returns `Some(frame)` with a reply to deliver back to the guest, or
/// `None` if the request was not something this proxy answers (a reply
/// frame, or the guest's own duplicate-address probe).
pub fn handle_request(repr: &ArpRepr, guest_ip: Ipv4Addr) -> Option<Vec<u8>> {
    let ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr,
        source_protocol_addr,
        target_protocol_addr,
        ..
    } = repr
    else {
        return None;
    };

    let target_ip: Ipv4Addr = (*target_protocol_addr).into();
    if target_ip == guest_ip {
        // Duplicate-address-detection probe: the guest is asking whether
        // anyone else already holds its own address. Nobody does.
        return None;
    }

    let requester_mac: EthernetAddress = *source_hardware_addr;
    let requester_ip: Ipv4Addr = (*source_protocol_addr).into();
    Some(wire::build_arp_reply(
        SYNTHETIC_HOST_MAC,
        target_ip,
        requester_mac,
        requester_ip,
    ))
}
