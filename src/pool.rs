//! Socket records and the fixed-capacity socket pool.
//!
//! The pool is an arena of `sock_count` records indexed by [`SockId`] plus a
//! free stack. A record is either free (on the stack, state `Free`) or
//! allocated (`USED` flag set), never both.
//!
//! Every allocation bumps the record's generation. Blocking callers capture
//! `(id, generation)` before releasing the stack lock and re-check it after
//! waking, so a wakeup never lands on a record that was freed and handed to
//! someone else in the meantime.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::accept::AcceptQueue;
use crate::addr::{ProtocolFamily, SockAddr, SocketProtocol, SocketType};
use crate::config::SockConfig;
use crate::conn::ConnId;
use crate::error::SockError;
use crate::select::{self, SelEvent, SelWaitObj};
use crate::wait::{Timeout, WaitQueue};

// ============================================================================
// Types
// ============================================================================

/// Socket handle (index into the pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SockId(pub u16);

impl SockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Socket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    /// Record on the free stack
    Free,
    /// Allocated, no local address
    Closed,
    /// Local address assigned
    Bound,
    /// Stream socket accepting connection requests
    Listen,
    /// Stream connection request sent
    ConnInProgress,
    /// Stream connection request completed, not yet observed by a call
    ConnDone,
    /// Connected
    Conn,
    /// Stream close handshake outstanding
    CloseInProgress,
    /// Peer closed; queued receive data still readable
    ClosingDataAvail,
    /// Connection failed; only close is legal
    ClosedFault,
}

bitflags! {
    /// Socket flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SockFlags: u8 {
        /// Record allocated
        const USED = 1 << 0;
        /// Calls never block
        const NON_BLOCKING = 1 << 1;
        /// Secure session requested
        const SECURE = 1 << 2;
        /// Secure handshake in progress
        const SECURE_NEGOTIATE = 1 << 3;
    }
}

/// Queued inbound datagram.
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    pub src: SockAddr,
    pub data: Vec<u8>,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    /// High-water mark of `in_use`
    pub max_used: usize,
    /// `get()` calls that found the pool empty
    pub alloc_failures: u64,
}

// ============================================================================
// Socket Record
// ============================================================================

/// One socket record.
#[derive(Debug)]
pub(crate) struct Socket {
    pub id: SockId,
    pub generation: u32,
    pub family: ProtocolFamily,
    pub ty: SocketType,
    pub state: SockState,
    pub flags: SockFlags,
    pub conn: Option<ConnId>,

    // Stream listener / child bookkeeping
    pub parent: Option<(SockId, u32)>,
    pub children: usize,
    pub max_children: Option<usize>,
    pub accept_q: Option<AcceptQueue>,

    // Datagram receive queue; ceilings apply to both types
    pub rx_q: VecDeque<Datagram>,
    pub rx_q_octets: usize,
    pub rx_q_max: usize,
    pub tx_q_max: usize,

    pub rx_signal: Arc<WaitQueue>,
    pub conn_signal: Arc<WaitQueue>,
    pub accept_signal: Arc<WaitQueue>,
    pub close_signal: Arc<WaitQueue>,
    pub rx_timeout: Timeout,
    pub tx_timeout: Timeout,
    pub conn_req_timeout: Timeout,
    pub accept_timeout: Timeout,
    pub close_timeout: Timeout,

    pub keep_alive: bool,
    pub no_delay: bool,

    /// Wait objects of select calls pending on this socket
    pub sel_waiters: Vec<SelWaitObj>,
    /// Pending error, reported once through the `Error` option
    pub fault: Option<SockError>,
}

impl Socket {
    fn new(id: SockId, generation: u32, cfg: &SockConfig) -> Self {
        Socket {
            id,
            generation,
            family: ProtocolFamily::Inet4,
            ty: SocketType::None,
            state: SockState::Free,
            flags: SockFlags::empty(),
            conn: None,
            parent: None,
            children: 0,
            max_children: None,
            accept_q: None,
            rx_q: VecDeque::new(),
            rx_q_octets: 0,
            rx_q_max: 0,
            tx_q_max: 0,
            rx_signal: Arc::new(WaitQueue::new()),
            conn_signal: Arc::new(WaitQueue::new()),
            accept_signal: Arc::new(WaitQueue::new()),
            close_signal: Arc::new(WaitQueue::new()),
            rx_timeout: cfg.rx_timeout,
            tx_timeout: cfg.tx_timeout,
            conn_req_timeout: cfg.conn_req_timeout,
            accept_timeout: cfg.accept_timeout,
            close_timeout: cfg.close_timeout,
            keep_alive: false,
            no_delay: false,
            sel_waiters: Vec::new(),
            fault: None,
        }
    }

    /// Transport protocol implied by the type.
    pub fn protocol(&self) -> Option<SocketProtocol> {
        match self.ty {
            SocketType::Stream => Some(SocketProtocol::Tcp),
            SocketType::Datagram => Some(SocketProtocol::Udp),
            SocketType::None => None,
        }
    }

    #[inline]
    pub fn is_non_blocking(&self) -> bool {
        self.flags.contains(SockFlags::NON_BLOCKING)
    }

    /// Record a state transition.
    pub fn set_state(&mut self, state: SockState) {
        if self.state != state {
            log::trace!("sock {}: {:?} -> {:?}", self.id.0, self.state, state);
            self.state = state;
        }
    }

    /// Enter `ClosedFault`, keeping the first fault for the `Error` option,
    /// and wake everything waiting on the socket so the fault is observed.
    pub fn fault(&mut self, err: SockError) {
        log::warn!("sock {}: fault {:?} in {:?}", self.id.0, err, self.state);
        self.set_state(SockState::ClosedFault);
        self.fault.get_or_insert(err);
        self.rx_signal.post();
        self.conn_signal.post();
        self.accept_signal.post();
        self.close_signal.post();
        select::post(self, SelEvent::Fault);
    }
}

/// Fatal assertion for a state no code path can produce.
#[cold]
pub(crate) fn fatal_state(id: SockId, state: SockState, op: &str) -> ! {
    log::error!("sock {}: corrupted state {:?} in {}", id.0, state, op);
    panic!("sock {}: corrupted state {:?} in {}", id.0, state, op);
}

// ============================================================================
// Pool
// ============================================================================

/// Fixed-capacity socket pool.
pub(crate) struct SockPool {
    socks: Vec<Socket>,
    free: Vec<SockId>,
    cfg: SockConfig,
    max_used: usize,
    alloc_failures: u64,
}

impl SockPool {
    pub fn new(cfg: &SockConfig) -> Self {
        let socks = (0..cfg.sock_count)
            .map(|i| Socket::new(SockId(i as u16), 0, cfg))
            .collect();
        // Reverse order so the lowest id is handed out first.
        let free = (0..cfg.sock_count as u16).rev().map(SockId).collect();
        SockPool {
            socks,
            free,
            cfg: *cfg,
            max_used: 0,
            alloc_failures: 0,
        }
    }

    /// Allocate a record in `Closed` with the type's default ceilings.
    pub fn get(&mut self, family: ProtocolFamily, ty: SocketType) -> Result<SockId, SockError> {
        let Some(id) = self.free.pop() else {
            self.alloc_failures += 1;
            log::debug!("sockpool: empty");
            return Err(SockError::PoolEmpty);
        };
        let cfg = &self.cfg;
        let sock = &mut self.socks[id.index()];
        let generation = sock.generation.wrapping_add(1);
        *sock = Socket::new(id, generation, cfg);
        sock.family = family;
        sock.ty = ty;
        sock.flags = SockFlags::USED;
        sock.state = SockState::Closed;
        (sock.rx_q_max, sock.tx_q_max) = match ty {
            SocketType::Datagram => (cfg.dgram_rx_q_size, cfg.dgram_tx_q_size),
            _ => (cfg.stream_rx_q_size, cfg.stream_tx_q_size),
        };
        self.max_used = self.max_used.max(self.in_use());
        log::trace!("sock {}: allocated ({:?}, gen {})", id.0, ty, generation);
        Ok(id)
    }

    /// Return a record to the pool.
    ///
    /// Aborts the record's wait signals and posts an abort to every select
    /// call pending on it before clearing it.
    pub fn free(&mut self, id: SockId) {
        let Some(sock) = self.socks.get_mut(id.index()) else {
            return;
        };
        if !sock.flags.contains(SockFlags::USED) {
            fatal_state(id, sock.state, "free");
        }
        sock.rx_signal.abort();
        sock.conn_signal.abort();
        sock.accept_signal.abort();
        sock.close_signal.abort();
        select::post(sock, SelEvent::Abort);

        let generation = sock.generation;
        *sock = Socket::new(id, generation, &self.cfg);
        self.free.push(id);
        log::trace!("sock {}: freed", id.0);
    }

    pub fn lookup(&self, id: SockId) -> Result<&Socket, SockError> {
        let sock = self
            .socks
            .get(id.index())
            .filter(|s| s.flags.contains(SockFlags::USED))
            .ok_or(SockError::InvalidHandle)?;
        if sock.state == SockState::Free {
            fatal_state(id, sock.state, "lookup");
        }
        Ok(sock)
    }

    pub fn lookup_mut(&mut self, id: SockId) -> Result<&mut Socket, SockError> {
        let sock = self
            .socks
            .get_mut(id.index())
            .filter(|s| s.flags.contains(SockFlags::USED))
            .ok_or(SockError::InvalidHandle)?;
        if sock.state == SockState::Free {
            fatal_state(id, sock.state, "lookup");
        }
        Ok(sock)
    }

    /// True while `id` is allocated with the given generation.
    pub fn is_current(&self, id: SockId, generation: u32) -> bool {
        self.socks
            .get(id.index())
            .is_some_and(|s| s.flags.contains(SockFlags::USED) && s.generation == generation)
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn in_use(&self) -> usize {
        self.socks.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.socks.len()
    }

    /// Ids of every allocated record.
    pub fn used_ids(&self) -> Vec<SockId> {
        self.socks
            .iter()
            .filter(|s| s.flags.contains(SockFlags::USED))
            .map(|s| s.id)
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            in_use: self.in_use(),
            max_used: self.max_used,
            alloc_failures: self.alloc_failures,
        }
    }
}
