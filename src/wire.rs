//! Loopback wire.
//!
//! Both transport engines emit packets here instead of handing them to a
//! driver; `SockCore::service` drains the queue in FIFO order and feeds each
//! packet back into the inbound demultiplexer. Delivery is lossless and
//! ordered.
//!
//! Stream segments carry a window *right edge* rather than a window size:
//! the total number of octets the receiver will have accepted once its
//! buffer is full (`octets read by the application + buffer size`). The edge
//! only grows, so a stale advertisement can never let a sender overrun the
//! receive buffer.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::addr::SockAddr;

/// Stream segment kinds of the loopback handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Connection request
    Syn { edge: u64 },
    /// Request accepted
    SynAck { edge: u64 },
    /// Handshake complete
    Ack { edge: u64 },
    /// Payload
    Data { edge: u64, payload: Vec<u8> },
    /// Window update
    Window { edge: u64 },
    /// Sender has no more data
    Fin,
    /// Acknowledges a FIN
    FinAck,
    /// Connection refused or aborted
    Rst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Datagram(Vec<u8>),
    Stream(Segment),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src: SockAddr,
    pub dst: SockAddr,
    pub body: Body,
}

/// In-flight packet queue.
#[derive(Debug, Default)]
pub struct Wire {
    queue: VecDeque<Packet>,
    delivered: u64,
}

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, src: SockAddr, dst: SockAddr, body: Body) {
        self.queue.push_back(Packet { src, dst, body });
    }

    pub fn push_segment(&mut self, src: SockAddr, dst: SockAddr, seg: Segment) {
        self.push(src, dst, Body::Stream(seg));
    }

    pub fn pop(&mut self) -> Option<Packet> {
        let pkt = self.queue.pop_front()?;
        self.delivered += 1;
        Some(pkt)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Packets taken off the wire so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}
