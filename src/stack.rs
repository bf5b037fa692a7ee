//! Socket layer context and public API.
//!
//! [`NetStack`] owns one [`SockCore`] behind a single global lock. Every
//! public call takes the lock, validates the handle and state, performs the
//! transition or transfer, lets the loopback wire settle, and releases the
//! lock.
//!
//! # Blocking
//!
//! Core operations never block. When one has to wait it returns
//! [`Step::Pend`] naming the signal and timeout; [`NetStack::block_on`]
//! drops the lock, pends, re-acquires the lock, checks that the socket is
//! still the same allocation, and retries the operation.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::addr::{ProtocolFamily, SockAddr, SocketProtocol, SocketType};
use crate::config::{SockConfig, DGRAM_PAYLOAD_MAX};
use crate::conn::{ConnId, ConnTable};
use crate::error::SockError;
use crate::options::{SockOpt, SockOptName};
use crate::pool::{fatal_state, PoolStats, SockId, SockPool, SockState};
use crate::select::{self, SelEvent, SelMask, SelWaitObj, SockDescSet};
use crate::tcp::TcpEngine;
use crate::udp::{UdpEngine, UdpStats};
use crate::wait::{Deadline, Timeout, WaitOutcome, WaitQueue};
use crate::wire::{Body, Wire};

/// Upper bound on packets processed by one `service()` pass.
const SERVICE_BUDGET: usize = 1 << 16;

// ============================================================================
// Call types
// ============================================================================

bitflags! {
    /// Per-call receive / transmit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// Receive without consuming
        const PEEK = 0x02;
        /// Never block on this call
        const DONTWAIT = 0x40;
    }
}

impl MsgFlags {
    /// Parse BSD `MSG_*` bits; anything unsupported (e.g. `MSG_OOB`) is rejected.
    pub fn from_raw(raw: u32) -> Result<Self, SockError> {
        MsgFlags::from_bits(raw).ok_or(SockError::InvalidArgument)
    }
}

/// Receive result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// `len` octets copied. `truncated` is set when a datagram did not fit.
    Data {
        len: usize,
        from: Option<SockAddr>,
        truncated: bool,
    },
    /// Peer closed the connection and no data remains
    Closed,
}

/// Transmit result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    Bytes(usize),
    /// Connection closed; nothing can be sent
    Closed,
}

/// Aggregate statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackStats {
    pub pool: PoolStats,
    pub conns_in_use: usize,
    pub udp: UdpStats,
    /// Packets carried by the loopback wire
    pub wire_delivered: u64,
}

/// Secure-session layer integration.
///
/// Hooks run with the stack lock held and must not call back into the
/// [`NetStack`].
pub trait SecureHooks: Send + Sync {
    /// Client handshake for a socket that just connected.
    fn connect(&self, sock: SockId, peer: SockAddr) -> Result<(), SockError>;
    /// Server handshake for a child accepted on a secure listener.
    fn accept(&self, listener: SockId, child: SockId, peer: SockAddr) -> Result<(), SockError>;
    /// The session is about to close.
    fn close_notify(&self, sock: SockId);
}

/// Outcome of one non-blocking attempt.
pub(crate) enum Step<T> {
    Done(T),
    Pend(Pend),
}

/// What a blocked call waits on.
pub(crate) struct Pend {
    pub queue: Arc<WaitQueue>,
    pub timeout: Timeout,
    pub sock: SockId,
    pub generation: u32,
}

// ============================================================================
// Core context
// ============================================================================

/// Everything the global lock protects.
pub(crate) struct SockCore {
    pub cfg: SockConfig,
    pub pool: SockPool,
    pub conns: ConnTable,
    pub tcp: TcpEngine,
    pub udp: UdpEngine,
    pub wire: Wire,
    pub secure: Option<&'static dyn SecureHooks>,
    next_sel_call: u64,
}

impl SockCore {
    fn new(cfg: SockConfig) -> Self {
        SockCore {
            pool: SockPool::new(&cfg),
            conns: ConnTable::new(cfg.conn_count, cfg.ephemeral_ports),
            tcp: TcpEngine::new(),
            udp: UdpEngine::new(),
            wire: Wire::new(),
            secure: None,
            next_sel_call: 0,
            cfg,
        }
    }

    /// Drain the wire: demultiplex every packet and apply the resulting
    /// stream events to their sockets.
    pub fn service(&mut self) {
        let mut budget = SERVICE_BUDGET;
        loop {
            self.dispatch_tcp_events();
            let Some(pkt) = self.wire.pop() else { break };
            match pkt.body {
                Body::Datagram(data) => self.dgram_demux(pkt.src, pkt.dst, data),
                Body::Stream(seg) => self.stream_input(pkt.src, pkt.dst, seg),
            }
            budget -= 1;
            if budget == 0 {
                log::warn!("sockcore: service budget exhausted, {} packets left", self.wire.len());
                break;
            }
        }
    }

    /// Build a [`Pend`] on `queue` for socket `id`.
    pub fn pend_on(&self, id: SockId, queue: &Arc<WaitQueue>, timeout: Timeout) -> Pend {
        let generation = self.pool.lookup(id).map_or(0, |s| s.generation);
        Pend {
            queue: queue.clone(),
            timeout,
            sock: id,
            generation,
        }
    }

    /// True when a call on `id` with `flags` must not block.
    pub fn no_block(&self, id: SockId, flags: MsgFlags) -> Result<bool, SockError> {
        Ok(self.pool.lookup(id)?.is_non_blocking() || flags.contains(MsgFlags::DONTWAIT))
    }

    // ------------------------------------------------------------------
    // Lifecycle shared by both types
    // ------------------------------------------------------------------

    fn open(
        &mut self,
        family: ProtocolFamily,
        ty: SocketType,
        proto: Option<SocketProtocol>,
    ) -> Result<SockId, SockError> {
        SocketProtocol::resolve(proto, ty)?;
        self.pool.get(family, ty)
    }

    /// Allocate a registry entry for `id` and bind it to `addr`.
    ///
    /// # Returns
    ///
    /// The address actually bound (ephemeral port filled in).
    pub fn bind_conn(&mut self, id: SockId, addr: SockAddr) -> Result<SockAddr, SockError> {
        let sock = self.pool.lookup(id)?;
        let family = sock.family;
        let protocol = sock.protocol().ok_or(SockError::InvalidType)?;
        let (rx_cap, tx_cap, keep_alive, no_delay) =
            (sock.rx_q_max, sock.tx_q_max, sock.keep_alive, sock.no_delay);

        let conn = self.conns.get(family, protocol)?;
        let bound = match self.conns.set_local_addr(conn, addr, false) {
            Ok(bound) => bound,
            Err(e) => {
                self.conns.close(conn);
                return Err(e.into());
            }
        };
        self.conns.set_app(conn, Some(id))?;
        if protocol == SocketProtocol::Tcp {
            self.tcp.open(conn, bound, rx_cap, tx_cap)?;
            self.tcp.set_keep_alive(conn, keep_alive);
            self.tcp.set_no_delay(conn, no_delay);
        }
        let sock = self.pool.lookup_mut(id)?;
        sock.conn = Some(conn);
        sock.set_state(SockState::Bound);
        log::trace!("sock {}: bound to {}", id.0, bound);
        Ok(bound)
    }

    fn bind(&mut self, id: SockId, addr: SockAddr) -> Result<(), SockError> {
        let sock = self.pool.lookup(id)?;
        match sock.state {
            SockState::Closed => {}
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            SockState::Free => fatal_state(id, sock.state, "bind"),
            _ => return Err(SockError::InvalidState),
        }
        if addr.ip.is_broadcast() {
            return Err(SockError::InvalidArgument);
        }
        self.bind_conn(id, addr).map(|_| ())
    }

    /// Detach `conn` from its socket; close the registry entry once the
    /// transport no longer needs it.
    pub fn release_conn(&mut self, conn: ConnId) {
        let _ = self.conns.set_app(conn, None);
        if !self.tcp.exists(conn) {
            self.conns.close(conn);
        }
    }

    /// Common tail of every close: detach the connection, drop the parent's
    /// child count and return the record to the pool.
    pub fn free_socket(&mut self, id: SockId) {
        let Ok(sock) = self.pool.lookup_mut(id) else {
            return;
        };
        let conn = sock.conn.take();
        let parent = sock.parent.take();
        if let Some(conn) = conn {
            self.tcp.detach(conn, &mut self.wire);
            self.release_conn(conn);
        }
        if let Some((pid, pgen)) = parent {
            if self.pool.is_current(pid, pgen) {
                if let Ok(p) = self.pool.lookup_mut(pid) {
                    p.children = p.children.saturating_sub(1);
                }
            }
        }
        self.pool.free(id);
    }

    /// Abortive close: reset every connection the socket holds and free it.
    pub fn abort_socket(&mut self, id: SockId) {
        self.abort_pending_children(id);
        if let Some(conn) = self.pool.lookup(id).ok().and_then(|s| s.conn) {
            self.tcp.abort(conn, &mut self.wire);
        }
        self.free_socket(id);
    }

    fn close(&mut self, id: SockId) -> Result<Step<()>, SockError> {
        match self.pool.lookup(id)?.ty {
            SocketType::Datagram => self.dgram_close(id).map(Step::Done),
            SocketType::Stream => self.stream_close(id),
            SocketType::None => Err(SockError::InvalidType),
        }
    }

    fn connect(&mut self, id: SockId, addr: SockAddr) -> Result<Step<()>, SockError> {
        match self.pool.lookup(id)?.ty {
            SocketType::Datagram => self.dgram_connect(id, addr).map(Step::Done),
            SocketType::Stream => self.stream_connect(id, Some(addr)),
            SocketType::None => Err(SockError::InvalidType),
        }
    }

    fn recv(&mut self, id: SockId, buf: &mut [u8], flags: MsgFlags) -> Result<Step<Recv>, SockError> {
        if buf.is_empty() {
            return Err(SockError::InvalidArgument);
        }
        match self.pool.lookup(id)?.ty {
            SocketType::Datagram => self.dgram_recv(id, buf, flags),
            SocketType::Stream => self.stream_recv(id, buf, flags),
            SocketType::None => Err(SockError::InvalidType),
        }
    }

    fn send(
        &mut self,
        id: SockId,
        data: &[u8],
        flags: MsgFlags,
        dest: Option<SockAddr>,
        queued: &mut usize,
    ) -> Result<Step<Sent>, SockError> {
        if flags.contains(MsgFlags::PEEK) {
            return Err(SockError::InvalidArgument);
        }
        match self.pool.lookup(id)?.ty {
            SocketType::Datagram => self.dgram_send(id, data, dest).map(Step::Done),
            SocketType::Stream => self.stream_send(id, data, flags, queued),
            SocketType::None => Err(SockError::InvalidType),
        }
    }

    fn next_sel_call(&mut self) -> u64 {
        self.next_sel_call = self.next_sel_call.wrapping_add(1);
        self.next_sel_call
    }
}

// ============================================================================
// Public API
// ============================================================================

/// BSD-style socket layer over the loopback transport.
pub struct NetStack {
    core: Mutex<SockCore>,
}

impl NetStack {
    /// Create a socket layer instance.
    pub fn new(cfg: SockConfig) -> Result<Self, SockError> {
        cfg.validate()?;
        Ok(NetStack {
            core: Mutex::new(SockCore::new(cfg)),
        })
    }

    /// Install the secure-session layer.
    pub fn set_secure_hooks(&self, hooks: &'static dyn SecureHooks) {
        self.core.lock().secure = Some(hooks);
    }

    /// Run `attempt` until it completes, pending between attempts with the
    /// lock released. `on_timeout` runs under the lock when the wait expires.
    fn block_on<T>(
        &self,
        mut attempt: impl FnMut(&mut SockCore) -> Result<Step<T>, SockError>,
        on_timeout: impl FnOnce(&mut SockCore, &Pend) -> Result<T, SockError>,
    ) -> Result<T, SockError> {
        let mut waiting: Option<(Arc<WaitQueue>, Deadline)> = None;
        let mut woken: Option<(SockId, u32)> = None;
        let mut retried_abort = false;
        loop {
            let pend = {
                let mut core = self.core.lock();
                if let Some((id, gen)) = woken {
                    if !core.pool.is_current(id, gen) {
                        return Err(SockError::Aborted);
                    }
                }
                let step = attempt(&mut *core);
                core.service();
                match step? {
                    Step::Done(v) => return Ok(v),
                    Step::Pend(p) => p,
                }
            };

            // Each signal has its own timeout; the deadline restarts when the
            // call moves on to a different queue.
            let dl = match &waiting {
                Some((queue, dl)) if Arc::ptr_eq(queue, &pend.queue) => *dl,
                _ => {
                    let dl = Deadline::after(pend.timeout);
                    waiting = Some((pend.queue.clone(), dl));
                    dl
                }
            };
            match pend.queue.pend(&dl) {
                WaitOutcome::Woken => woken = Some((pend.sock, pend.generation)),
                // A transport signal aborted under a live socket (connection
                // reset): retry once so the call reports the socket's fault.
                WaitOutcome::Aborted if !retried_abort => {
                    retried_abort = true;
                    woken = Some((pend.sock, pend.generation));
                }
                WaitOutcome::Aborted => return Err(SockError::Aborted),
                WaitOutcome::TimedOut => {
                    let mut core = self.core.lock();
                    if !core.pool.is_current(pend.sock, pend.generation) {
                        return Err(SockError::Aborted);
                    }
                    let result = on_timeout(&mut *core, &pend);
                    core.service();
                    return result;
                }
            }
        }
    }

    fn with_core<T>(&self, f: impl FnOnce(&mut SockCore) -> Result<T, SockError>) -> Result<T, SockError> {
        let mut core = self.core.lock();
        let result = f(&mut *core);
        core.service();
        result
    }

    /// Allocate a socket. `proto: None` infers the protocol from the type.
    pub fn open(
        &self,
        family: ProtocolFamily,
        ty: SocketType,
        proto: Option<SocketProtocol>,
    ) -> Result<SockId, SockError> {
        self.with_core(|core| core.open(family, ty, proto))
    }

    /// Close a socket and return it to the pool.
    ///
    /// A connected stream socket closes gracefully: with a blocking close the
    /// call waits (up to the close timeout) for the peer to acknowledge the
    /// FIN; when that wait expires the connection is reset instead.
    pub fn close(&self, id: SockId) -> Result<(), SockError> {
        self.block_on(
            |core| core.close(id),
            |core, _| {
                log::debug!("sock {}: close timed out, resetting", id.0);
                core.abort_socket(id);
                Ok(())
            },
        )
    }

    pub fn bind(&self, id: SockId, addr: &SockAddr) -> Result<(), SockError> {
        self.with_core(|core| core.bind(id, *addr))
    }

    /// Connect to `addr`. Datagram sockets just record the peer; stream
    /// sockets run the open handshake, returning `InProgress` when
    /// non-blocking.
    pub fn connect(&self, id: SockId, addr: &SockAddr) -> Result<(), SockError> {
        let addr = *addr;
        let mut first = true;
        self.block_on(
            move |core| {
                if first {
                    first = false;
                    core.connect(id, addr)
                } else {
                    core.stream_connect(id, None)
                }
            },
            |core, _| core.stream_connect_timeout(id),
        )
    }

    /// Start accepting connections. `backlog: None` uses the configured
    /// default queue size.
    pub fn listen(&self, id: SockId, backlog: Option<usize>) -> Result<(), SockError> {
        self.with_core(|core| core.stream_listen(id, backlog))
    }

    /// Take the oldest established connection of a listening socket.
    pub fn accept(&self, id: SockId) -> Result<(SockId, SockAddr), SockError> {
        self.block_on(|core| core.stream_accept(id), |_, _| Err(SockError::Timeout))
    }

    /// Receive into `buf`.
    ///
    /// Datagram sockets return one datagram per call, truncated to `buf`
    /// (the rest is discarded unless peeking). Stream sockets return
    /// whatever is queued up to `buf.len()`.
    pub fn recv_from(&self, id: SockId, buf: &mut [u8], flags: MsgFlags) -> Result<Recv, SockError> {
        self.block_on(|core| core.recv(id, buf, flags), |_, _| Err(SockError::Timeout))
    }

    pub fn recv(&self, id: SockId, buf: &mut [u8], flags: MsgFlags) -> Result<Recv, SockError> {
        self.recv_from(id, buf, flags)
    }

    /// Transmit `data`, to `dest` or the connected peer.
    ///
    /// Datagrams are sent whole or not at all. Stream data is queued up to
    /// the transmit ceiling; a blocking send waits for room until all of it
    /// is queued, returning the partial count if the wait ends early.
    pub fn send_to(
        &self,
        id: SockId,
        data: &[u8],
        flags: MsgFlags,
        dest: Option<&SockAddr>,
    ) -> Result<Sent, SockError> {
        let dest = dest.copied();
        let mut queued = 0usize;
        let result = self.block_on(
            |core| core.send(id, data, flags, dest, &mut queued),
            |_, _| Err(SockError::Timeout),
        );
        match result {
            Err(SockError::Timeout | SockError::Aborted) if queued > 0 => Ok(Sent::Bytes(queued)),
            other => other,
        }
    }

    pub fn send(&self, id: SockId, data: &[u8], flags: MsgFlags) -> Result<Sent, SockError> {
        self.send_to(id, data, flags, None)
    }

    /// Wait until a socket in one of the sets is ready.
    ///
    /// On success each given set is replaced by its ready subset and the
    /// total number of ready bits is returned. When nothing becomes ready
    /// the sets are cleared and `Timeout` (deadline passed) or `Aborted`
    /// (woken with nothing ready) is returned.
    pub fn select(
        &self,
        rd: Option<&mut SockDescSet>,
        wr: Option<&mut SockDescSet>,
        er: Option<&mut SockDescSet>,
        timeout: Timeout,
    ) -> Result<usize, SockError> {
        let mut sets = [rd, wr, er];
        let req: [SockDescSet; 3] =
            core::array::from_fn(|i| sets[i].as_deref().copied().unwrap_or_default());
        let union: SockDescSet = req.iter().flat_map(|s| s.iter()).collect();

        let write_back = |sets: &mut [Option<&mut SockDescSet>; 3], ready: [SockDescSet; 3]| {
            for (slot, r) in sets.iter_mut().zip(ready) {
                if let Some(s) = slot.as_deref_mut() {
                    *s = r;
                }
            }
        };

        let (sem, call, linked) = {
            let mut core = self.core.lock();
            core.service();
            if union.nfds() > core.cfg.sel_desc_max {
                return Err(SockError::InvalidArgument);
            }
            let (n, ready) = select::scan(&core.pool, &core.tcp, &req)?;
            if n > 0 {
                write_back(&mut sets, ready);
                return Ok(n);
            }
            if timeout.is_no_wait() {
                write_back(&mut sets, Default::default());
                return Err(SockError::Timeout);
            }
            if union.is_empty() && timeout == Timeout::Infinite {
                return Err(SockError::InvalidArgument);
            }

            let sem = Arc::new(WaitQueue::new());
            let call = core.next_sel_call();
            let mut linked = Vec::new();
            for id in union.iter() {
                let mut mask = SelMask::empty();
                mask.set(SelMask::READ, req[0].is_set(id));
                mask.set(SelMask::WRITE, req[1].is_set(id));
                mask.set(SelMask::ERROR, req[2].is_set(id));
                let sock = core.pool.lookup_mut(id)?;
                select::link(
                    sock,
                    SelWaitObj {
                        call,
                        mask,
                        sem: sem.clone(),
                    },
                );
                linked.push((id, sock.generation));
            }
            (sem, call, linked)
        };

        let outcome = sem.pend(&Deadline::after(timeout));

        let mut core = self.core.lock();
        let mut freed = false;
        for &(id, gen) in &linked {
            if core.pool.is_current(id, gen) {
                if let Ok(sock) = core.pool.lookup_mut(id) {
                    select::unlink(sock, call);
                }
            } else {
                freed = true;
            }
        }
        if freed {
            write_back(&mut sets, Default::default());
            return Err(SockError::Aborted);
        }
        match select::scan(&core.pool, &core.tcp, &req) {
            Ok((n, ready)) if n > 0 => {
                write_back(&mut sets, ready);
                Ok(n)
            }
            Ok(_) => {
                write_back(&mut sets, Default::default());
                match outcome {
                    WaitOutcome::TimedOut => Err(SockError::Timeout),
                    _ => Err(SockError::Aborted),
                }
            }
            Err(e) => {
                write_back(&mut sets, Default::default());
                Err(e)
            }
        }
    }

    /// Wake every select pending on `id` as if the socket were aborted.
    pub fn select_abort(&self, id: SockId) -> Result<(), SockError> {
        self.with_core(|core| {
            select::post(core.pool.lookup(id)?, SelEvent::Abort);
            Ok(())
        })
    }

    pub fn set_option(&self, id: SockId, opt: SockOpt) -> Result<(), SockError> {
        self.with_core(|core| core.set_option(id, opt))
    }

    pub fn get_option(&self, id: SockId, name: SockOptName) -> Result<SockOpt, SockError> {
        self.with_core(|core| core.get_option(id, name))
    }

    /// Bound local address (`getsockname`).
    pub fn local_addr(&self, id: SockId) -> Result<SockAddr, SockError> {
        self.with_core(|core| {
            let conn = core.pool.lookup(id)?.conn.ok_or(SockError::InvalidState)?;
            core.conns.local_addr(conn).ok_or(SockError::InvalidState)
        })
    }

    /// Connected peer address (`getpeername`).
    pub fn peer_addr(&self, id: SockId) -> Result<SockAddr, SockError> {
        self.with_core(|core| {
            let conn = core.pool.lookup(id)?.conn.ok_or(SockError::InvalidState)?;
            core.conns.remote_addr(conn).ok_or(SockError::InvalidState)
        })
    }

    pub fn state(&self, id: SockId) -> Result<SockState, SockError> {
        self.with_core(|core| Ok(core.pool.lookup(id)?.state))
    }

    /// True for a connected socket, including one whose peer has closed.
    pub fn is_connected(&self, id: SockId) -> Result<bool, SockError> {
        let state = self.state(id)?;
        Ok(matches!(
            state,
            SockState::Conn | SockState::ConnDone | SockState::ClosingDataAvail
        ))
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.core.lock().pool.stats()
    }

    pub fn stats(&self) -> StackStats {
        let core = self.core.lock();
        StackStats {
            pool: core.pool.stats(),
            conns_in_use: core.conns.in_use(),
            udp: core.udp.stats(),
            wire_delivered: core.wire.delivered(),
        }
    }

    /// Abort every socket, e.g. when the interface goes down.
    pub fn close_all(&self) {
        let mut core = self.core.lock();
        for id in core.pool.used_ids() {
            core.abort_socket(id);
        }
        core.service();
        log::debug!("sockcore: all sockets closed");
    }

    /// Process everything pending on the wire.
    pub fn poll(&self) {
        self.core.lock().service();
    }

    /// Driver receive path: hand a datagram to the demultiplexer.
    pub fn inject_datagram(&self, src: SockAddr, dst: SockAddr, payload: &[u8]) -> Result<(), SockError> {
        if payload.len() > DGRAM_PAYLOAD_MAX {
            return Err(SockError::WouldOverflow);
        }
        let mut core = self.core.lock();
        core.wire.push(src, dst, Body::Datagram(payload.to_vec()));
        core.service();
        Ok(())
    }
}
