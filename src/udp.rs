//! Datagram engine.
//!
//! Validates outbound datagrams, puts them on the loopback wire and keeps
//! protocol counters. Inbound demultiplexing into socket receive queues
//! lives with the socket layer (`dgram`), which owns the queues.

use alloc::vec::Vec;

use crate::addr::SockAddr;
use crate::config::DGRAM_PAYLOAD_MAX;
use crate::wire::{Body, Wire};

/// Datagram engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    /// Payload larger than an IPv4 datagram can carry
    PayloadTooLarge,
    /// Destination address or port unspecified
    InvalidDest,
}

/// UDP protocol statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpStats {
    /// Datagrams queued to a socket
    pub rx_packets: u64,
    /// Payload octets queued to a socket
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Dropped: receive queue ceiling reached
    pub rx_queue_full: u64,
    /// Dropped: no socket bound to the destination
    pub no_listener: u64,
}

#[derive(Debug, Default)]
pub struct UdpEngine {
    stats: UdpStats,
}

impl UdpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transmit one datagram.
    pub fn tx(
        &mut self,
        src: SockAddr,
        dst: SockAddr,
        payload: &[u8],
        wire: &mut Wire,
    ) -> Result<(), UdpError> {
        if payload.len() > DGRAM_PAYLOAD_MAX {
            return Err(UdpError::PayloadTooLarge);
        }
        if !dst.is_routable() {
            return Err(UdpError::InvalidDest);
        }
        wire.push(src, dst, Body::Datagram(Vec::from(payload)));
        self.stats.tx_packets += 1;
        self.stats.tx_bytes += payload.len() as u64;
        log::trace!("udp: {} -> {} len={}", src, dst, payload.len());
        Ok(())
    }

    #[inline]
    pub fn record_rx(&mut self, len: usize) {
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += len as u64;
    }

    #[inline]
    pub fn record_queue_full(&mut self) {
        self.stats.rx_queue_full += 1;
    }

    #[inline]
    pub fn record_no_listener(&mut self) {
        self.stats.no_listener += 1;
    }

    pub fn stats(&self) -> UdpStats {
        self.stats
    }
}
