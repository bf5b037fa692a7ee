//! Select support: descriptor sets, wait objects, readiness and posting.
//!
//! A pending `select` call links one [`SelWaitObj`] onto every socket it
//! names. All objects of one call share a single semaphore; any socket
//! event whose mask intersects an object's interest posts that semaphore.
//! The call unlinks all of its objects after waking and recomputes
//! readiness from socket state, so posting is only ever a hint.

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::addr::SocketType;
use crate::config::SOCK_DESC_MAX;
use crate::error::SockError;
use crate::pool::{fatal_state, SockId, SockPool, SockState, Socket};
use crate::tcp::TcpEngine;
use crate::wait::WaitQueue;

bitflags! {
    /// Select interest / readiness mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SelMask: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
    }
}

/// Socket events that may satisfy a pending select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelEvent {
    Rx,
    Tx,
    ConnComplete,
    AcceptReady,
    Close,
    Fault,
    Abort,
}

impl SelEvent {
    pub fn mask(self) -> SelMask {
        match self {
            SelEvent::Rx | SelEvent::AcceptReady => SelMask::READ,
            SelEvent::Tx => SelMask::WRITE,
            SelEvent::ConnComplete => SelMask::WRITE | SelMask::ERROR,
            SelEvent::Close | SelEvent::Fault | SelEvent::Abort => SelMask::all(),
        }
    }
}

/// Wait object linked onto a socket by a pending select call.
#[derive(Debug, Clone)]
pub(crate) struct SelWaitObj {
    pub call: u64,
    pub mask: SelMask,
    pub sem: Arc<WaitQueue>,
}

// ============================================================================
// Descriptor set
// ============================================================================

const WORDS: usize = SOCK_DESC_MAX / 64;

/// Fixed-size socket descriptor set (`fd_set`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SockDescSet {
    bits: [u64; WORDS],
}

impl SockDescSet {
    pub const fn new() -> Self {
        SockDescSet { bits: [0; WORDS] }
    }

    /// Add `id`; out-of-range ids are ignored.
    pub fn set(&mut self, id: SockId) {
        if id.index() < SOCK_DESC_MAX {
            self.bits[id.index() / 64] |= 1 << (id.index() % 64);
        }
    }

    pub fn clear(&mut self, id: SockId) {
        if id.index() < SOCK_DESC_MAX {
            self.bits[id.index() / 64] &= !(1 << (id.index() % 64));
        }
    }

    pub fn is_set(&self, id: SockId) -> bool {
        id.index() < SOCK_DESC_MAX && self.bits[id.index() / 64] & (1 << (id.index() % 64)) != 0
    }

    pub fn zero(&mut self) {
        self.bits = [0; WORDS];
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Member ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = SockId> + '_ {
        (0..SOCK_DESC_MAX)
            .map(|i| SockId(i as u16))
            .filter(move |&id| self.is_set(id))
    }

    /// Highest member plus one (the BSD `nfds`), zero when empty.
    pub fn nfds(&self) -> usize {
        self.iter().last().map_or(0, |id| id.index() + 1)
    }
}

impl FromIterator<SockId> for SockDescSet {
    fn from_iter<I: IntoIterator<Item = SockId>>(iter: I) -> Self {
        let mut set = SockDescSet::new();
        for id in iter {
            set.set(id);
        }
        set
    }
}

// ============================================================================
// Wait list
// ============================================================================

/// Post `event` to every select pending on `sock` with an intersecting
/// interest mask.
pub(crate) fn post(sock: &Socket, event: SelEvent) {
    let mask = event.mask();
    for obj in &sock.sel_waiters {
        if obj.mask.intersects(mask) {
            obj.sem.post();
        }
    }
}

pub(crate) fn link(sock: &mut Socket, obj: SelWaitObj) {
    sock.sel_waiters.push(obj);
}

/// Remove every wait object owned by select call `call`.
pub(crate) fn unlink(sock: &mut Socket, call: u64) {
    sock.sel_waiters.retain(|o| o.call != call);
}

// ============================================================================
// Readiness
// ============================================================================

/// Current readiness of `sock`.
///
/// Soft conditions (nothing to read, queue full, connection pending) simply
/// read as not ready; a socket without a type is a hard error.
pub(crate) fn readiness(sock: &Socket, tcp: &TcpEngine) -> Result<SelMask, SockError> {
    let mut ready = SelMask::empty();
    match sock.ty {
        SocketType::None => return Err(SockError::InvalidType),
        SocketType::Datagram => match sock.state {
            SockState::Closed => ready |= SelMask::WRITE,
            SockState::Bound | SockState::Conn => {
                ready |= SelMask::WRITE;
                if !sock.rx_q.is_empty() {
                    ready |= SelMask::READ;
                }
            }
            SockState::ClosedFault => ready |= SelMask::ERROR,
            state => fatal_state(sock.id, state, "select"),
        },
        SocketType::Stream => match sock.state {
            SockState::Closed | SockState::Bound | SockState::ConnInProgress => {}
            SockState::CloseInProgress => {}
            SockState::Listen => {
                if sock.accept_q.as_ref().is_some_and(|q| q.has_ready()) {
                    ready |= SelMask::READ;
                }
            }
            SockState::Conn | SockState::ConnDone => {
                if let Some(conn) = sock.conn {
                    if tcp.rx_available(conn) > 0 {
                        ready |= SelMask::READ;
                    }
                    if tcp.tx_room(conn) > 0 {
                        ready |= SelMask::WRITE;
                    }
                }
            }
            SockState::ClosingDataAvail => ready |= SelMask::READ | SelMask::WRITE,
            SockState::ClosedFault => ready |= SelMask::ERROR,
            SockState::Free => fatal_state(sock.id, sock.state, "select"),
        },
    }
    Ok(ready)
}

/// Readiness pass over the requested sets.
///
/// # Returns
///
/// Total ready bits and, per set, the ready subset of the request.
pub(crate) fn scan(
    pool: &SockPool,
    tcp: &TcpEngine,
    req: &[SockDescSet; 3],
) -> Result<(usize, [SockDescSet; 3]), SockError> {
    const WANT: [SelMask; 3] = [SelMask::READ, SelMask::WRITE, SelMask::ERROR];
    let mut ready = [SockDescSet::new(); 3];
    let mut count = 0;
    let union: SockDescSet = req.iter().flat_map(|s| s.iter()).collect();
    for id in union.iter() {
        let mask = readiness(pool.lookup(id)?, tcp)?;
        for (i, want) in WANT.iter().enumerate() {
            if req[i].is_set(id) && mask.contains(*want) {
                ready[i].set(id);
                count += 1;
            }
        }
    }
    Ok((count, ready))
}
