//! Stream sockets: connection lifecycle on top of the TCP engine.
//!
//! Socket calls translate into [`TcpEngine`](crate::tcp::TcpEngine)
//! operations; engine events come back through
//! [`SockCore::dispatch_tcp_events`] after every wire pass and drive the
//! socket state machine:
//!
//! ```text
//!   Closed --bind--> Bound --connect--> ConnInProgress --Connected--> ConnDone
//!   ConnDone --next recv/send/connect--> Conn
//!   Bound --listen--> Listen --accept--> (child in Conn)
//!   Conn --PeerClosed--> ClosingDataAvail
//!   Conn | ClosingDataAvail --close--> CloseInProgress --CloseComplete--> Free
//!   any --Reset--> ClosedFault
//! ```

use alloc::vec::Vec;

use crate::addr::{Ipv4Addr, ProtocolFamily, SockAddr, SocketProtocol, SocketType};
use crate::conn::{ConnId, MatchKind};
use crate::error::SockError;
use crate::pool::{fatal_state, SockFlags, SockId, SockState, Socket};
use crate::select::{self, SelEvent};
use crate::stack::{MsgFlags, Recv, Sent, SockCore, Step};
use crate::tcp::TcpEvent;
use crate::wait::Timeout;
use crate::wire::Segment;

impl SockCore {
    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Inbound stream segment from the wire.
    pub(crate) fn stream_input(&mut self, src: SockAddr, dst: SockAddr, seg: Segment) {
        match self
            .conns
            .search(ProtocolFamily::Inet4, SocketProtocol::Tcp, dst, Some(src))
        {
            Some((conn, MatchKind::Exact)) => self.tcp.input(conn, seg, &mut self.wire),
            Some((listener, _)) => match seg {
                Segment::Syn { edge } => self.stream_conn_req(listener, src, dst, edge),
                Segment::Rst => {}
                _ => self.wire.push_segment(dst, src, Segment::Rst),
            },
            None if seg == Segment::Rst => {}
            None => {
                log::debug!("tcp: no connection for {} from {}, resetting", dst, src);
                self.wire.push_segment(dst, src, Segment::Rst);
            }
        }
    }

    /// Connection request for a listening entry.
    ///
    /// Requests a listener cannot take right now are dropped silently; only
    /// a port nobody listens on is refused.
    fn stream_conn_req(&mut self, listener: ConnId, src: SockAddr, dst: SockAddr, edge: u64) {
        let lsock = self.conns.app(listener).and_then(|id| self.pool.lookup(id).ok());
        let Some(lsock) = lsock.filter(|s| s.state == SockState::Listen) else {
            log::debug!("tcp: {} not listening, refusing {}", dst, src);
            self.wire.push_segment(dst, src, Segment::Rst);
            return;
        };
        let lid = lsock.id;
        let avail = lsock
            .accept_q
            .as_ref()
            .is_some_and(|q| q.is_avail(lsock.children, lsock.max_children));
        if !avail {
            log::debug!("sock {}: accept queue full, dropping SYN from {}", lid.0, src);
            return;
        }
        let (rx_cap, tx_cap) = (lsock.rx_q_max, lsock.tx_q_max);

        let child = match self.conns.get(ProtocolFamily::Inet4, SocketProtocol::Tcp) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("sock {}: no connection for SYN from {}: {:?}", lid.0, src, e);
                return;
            }
        };
        // Remote first: the child shares the listener's local address.
        let linked = self
            .conns
            .set_remote_addr(child, src, false)
            .and_then(|_| self.conns.set_local_addr(child, dst, false));
        if linked.is_err() {
            self.conns.close(child);
            return;
        }
        if let Err(e) = self
            .tcp
            .accept_syn(listener, child, dst, src, edge, rx_cap, tx_cap, &mut self.wire)
        {
            log::debug!("sock {}: SYN from {} rejected: {:?}", lid.0, src, e);
            self.conns.close(child);
            return;
        }
        let queued = self
            .pool
            .lookup_mut(lid)
            .ok()
            .and_then(|s| s.accept_q.as_mut())
            .map(|q| q.push(child));
        if !matches!(queued, Some(Ok(()))) {
            self.tcp.abort(child, &mut self.wire);
            self.conns.close(child);
            return;
        }
        log::trace!("sock {}: connection request {:?} from {}", lid.0, child, src);
    }

    /// Apply every pending engine event to its socket.
    pub(crate) fn dispatch_tcp_events(&mut self) {
        while let Some(event) = self.tcp.pop_event() {
            match event {
                TcpEvent::Connected(conn) => {
                    if let Some(sock) = self.app_sock_mut(conn) {
                        if sock.state == SockState::ConnInProgress {
                            sock.set_state(SockState::ConnDone);
                        }
                        sock.conn_signal.post();
                        select::post(sock, SelEvent::ConnComplete);
                    }
                }
                TcpEvent::Established(child) => self.stream_child_ready(child),
                TcpEvent::DataReady(conn) => {
                    if let Some(sock) = self.app_sock_mut(conn) {
                        sock.rx_signal.post();
                        select::post(sock, SelEvent::Rx);
                    }
                }
                TcpEvent::TxReady(conn) => {
                    if let Some(sock) = self.app_sock_mut(conn) {
                        select::post(sock, SelEvent::Tx);
                    }
                }
                TcpEvent::PeerClosed(conn) => {
                    if let Some(sock) = self.app_sock_mut(conn) {
                        if matches!(sock.state, SockState::Conn | SockState::ConnDone) {
                            sock.set_state(SockState::ClosingDataAvail);
                        }
                        sock.rx_signal.post();
                        select::post(sock, SelEvent::Close);
                    }
                }
                TcpEvent::CloseComplete(conn) => {
                    if let Some(sock) = self.app_sock_mut(conn) {
                        sock.close_signal.post();
                    }
                }
                TcpEvent::Reset(conn) => self.stream_reset(conn),
                TcpEvent::Released(conn) => {
                    if self.conns.app(conn).is_none() {
                        self.conns.close(conn);
                    }
                }
            }
        }
    }

    fn app_sock_mut(&mut self, conn: ConnId) -> Option<&mut Socket> {
        let id = self.conns.app(conn)?;
        self.pool.lookup_mut(id).ok()
    }

    /// A child finished its handshake: make it visible to `accept`.
    fn stream_child_ready(&mut self, child: ConnId) {
        let Some(listener) = self.tcp.listener_of(child) else {
            return;
        };
        let lid = self.conns.app(listener);
        let marked = match lid.and_then(|id| self.pool.lookup_mut(id).ok()) {
            Some(sock) if sock.state == SockState::Listen => {
                let ready = sock.accept_q.as_mut().is_some_and(|q| q.mark_ready(child));
                if ready {
                    sock.accept_signal.post();
                    select::post(sock, SelEvent::AcceptReady);
                }
                ready
            }
            _ => false,
        };
        if !marked {
            log::debug!("tcp: orphaned child {:?}, resetting", child);
            self.tcp.abort(child, &mut self.wire);
            self.conns.close(child);
        }
    }

    /// The engine dropped `conn` after a reset.
    fn stream_reset(&mut self, conn: ConnId) {
        match self.conns.app(conn) {
            Some(id) => {
                if let Ok(sock) = self.pool.lookup_mut(id) {
                    sock.conn = None;
                    match sock.state {
                        SockState::CloseInProgress => sock.close_signal.post(),
                        SockState::ConnInProgress => sock.fault(SockError::ConnRefused),
                        _ => sock.fault(SockError::ConnFault),
                    }
                }
            }
            None => {
                // Not yet accepted: drop it from whichever listener holds it.
                for id in self.pool.used_ids() {
                    let removed = self
                        .pool
                        .lookup_mut(id)
                        .ok()
                        .and_then(|s| s.accept_q.as_mut())
                        .is_some_and(|q| q.remove(conn));
                    if removed {
                        log::debug!("sock {}: pending {:?} reset", id.0, conn);
                        break;
                    }
                }
            }
        }
        self.conns.close(conn);
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    pub(crate) fn stream_listen(&mut self, id: SockId, backlog: Option<usize>) -> Result<(), SockError> {
        if backlog == Some(0) {
            return Err(SockError::InvalidArgument);
        }
        let sock = self.pool.lookup(id)?;
        if sock.ty != SocketType::Stream {
            return Err(SockError::InvalidType);
        }
        match sock.state {
            SockState::Bound => {}
            SockState::Listen => return Ok(()),
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            SockState::Free => fatal_state(id, sock.state, "listen"),
            _ => return Err(SockError::InvalidState),
        }
        let Some(conn) = sock.conn else {
            fatal_state(id, sock.state, "listen");
        };
        self.tcp.listen(conn)?;

        let queue = crate::accept::AcceptQueue::new(
            backlog,
            self.cfg.accept_q_default,
            self.cfg.accept_q_max,
        );
        let sock = self.pool.lookup_mut(id)?;
        log::debug!("sock {}: listening, queue {}", id.0, queue.capacity());
        sock.accept_q = Some(queue);
        sock.set_state(SockState::Listen);
        Ok(())
    }

    /// Active open. `addr` is `None` when a blocked caller retries.
    pub(crate) fn stream_connect(
        &mut self,
        id: SockId,
        addr: Option<SockAddr>,
    ) -> Result<Step<()>, SockError> {
        let no_block = self.no_block(id, MsgFlags::empty())?;
        let sock = self.pool.lookup(id)?;
        let state = sock.state;
        match state {
            SockState::Closed | SockState::Bound => {
                let remote = addr.ok_or(SockError::InvalidState)?;
                self.stream_open(id, state, remote)?;
            }
            SockState::ConnInProgress => {}
            SockState::ConnDone => {
                self.stream_promote(id)?;
                return Ok(Step::Done(()));
            }
            SockState::Conn | SockState::ClosingDataAvail if addr.is_none() => {
                return Ok(Step::Done(()));
            }
            SockState::Conn
            | SockState::ClosingDataAvail
            | SockState::Listen
            | SockState::CloseInProgress => return Err(SockError::InvalidState),
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            SockState::Free => fatal_state(id, state, "connect"),
        }

        let sock = self.pool.lookup(id)?;
        let state = sock.state;
        match state {
            SockState::ConnDone => {
                self.stream_promote(id)?;
                Ok(Step::Done(()))
            }
            SockState::ClosedFault => Err(sock.fault.unwrap_or(SockError::ConnRefused)),
            _ if no_block => Err(SockError::InProgress),
            _ => {
                let (queue, timeout) = (sock.conn_signal.clone(), sock.conn_req_timeout);
                Ok(Step::Pend(self.pend_on(id, &queue, timeout)))
            }
        }
    }

    /// Bind if needed, fix the source address and send the SYN.
    fn stream_open(&mut self, id: SockId, state: SockState, remote: SockAddr) -> Result<(), SockError> {
        if !remote.is_routable() {
            return Err(SockError::InvalidArgument);
        }
        if state == SockState::Closed {
            self.bind_conn(id, SockAddr::any(0))?;
        }
        let sock = self.pool.lookup(id)?;
        let Some(conn) = sock.conn else {
            fatal_state(id, sock.state, "connect");
        };
        let mut local = self.conns.local_addr(conn).ok_or(SockError::InvalidState)?;
        if local.ip.is_unspecified() {
            local.ip = Ipv4Addr::LOCALHOST;
        }
        if self
            .conns
            .tuple_in_use(conn, SocketProtocol::Tcp, local, remote)
        {
            return Err(SockError::AddrInUse);
        }
        self.conns.set_remote_addr(conn, remote, true)?;
        self.conns.set_local_addr(conn, local, true)?;
        self.tcp.connect(conn, local, remote, &mut self.wire)?;
        self.pool.lookup_mut(id)?.set_state(SockState::ConnInProgress);
        log::debug!("sock {}: connecting {} -> {}", id.0, local, remote);
        Ok(())
    }

    /// The connect wait expired.
    pub(crate) fn stream_connect_timeout(&mut self, id: SockId) -> Result<(), SockError> {
        match self.pool.lookup(id)?.state {
            SockState::ConnDone => self.stream_promote(id),
            SockState::ConnInProgress => {
                self.stream_fail(id, SockError::Timeout);
                Err(SockError::Timeout)
            }
            _ => Err(SockError::Timeout),
        }
    }

    /// `ConnDone -> Conn`, running the secure client handshake when enabled.
    fn stream_promote(&mut self, id: SockId) -> Result<(), SockError> {
        let sock = self.pool.lookup_mut(id)?;
        if sock.state != SockState::ConnDone {
            return Ok(());
        }
        sock.set_state(SockState::Conn);
        if !sock.flags.contains(SockFlags::SECURE) {
            return Ok(());
        }
        let peer = sock
            .conn
            .and_then(|c| self.conns.remote_addr(c))
            .ok_or(SockError::InvalidState)?;
        let Some(hooks) = self.secure else {
            self.stream_fail(id, SockError::InvalidState);
            return Err(SockError::InvalidState);
        };

        sock.flags.insert(SockFlags::SECURE_NEGOTIATE);
        let result = hooks.connect(id, peer);
        if let Ok(sock) = self.pool.lookup_mut(id) {
            sock.flags.remove(SockFlags::SECURE_NEGOTIATE);
        }
        if let Err(e) = result {
            log::warn!("sock {}: secure handshake with {} failed: {}", id.0, peer, e);
            self.stream_fail(id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Reset the connection and leave the socket in `ClosedFault`.
    fn stream_fail(&mut self, id: SockId, err: SockError) {
        let conn = self.pool.lookup_mut(id).ok().and_then(|s| s.conn.take());
        if let Some(conn) = conn {
            self.tcp.abort(conn, &mut self.wire);
            self.release_conn(conn);
        }
        if let Ok(sock) = self.pool.lookup_mut(id) {
            sock.fault(err);
        }
    }

    /// Take the oldest ready connection.
    pub(crate) fn stream_accept(&mut self, id: SockId) -> Result<Step<(SockId, SockAddr)>, SockError> {
        let no_block = self.no_block(id, MsgFlags::empty())?;
        let sock = self.pool.lookup(id)?;
        if sock.ty != SocketType::Stream {
            return Err(SockError::InvalidType);
        }
        match sock.state {
            SockState::Listen => {}
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            SockState::Free => fatal_state(id, sock.state, "accept"),
            _ => return Err(SockError::InvalidState),
        }
        if !sock.accept_q.as_ref().is_some_and(|q| q.has_ready()) {
            if no_block {
                return Err(SockError::WouldBlock);
            }
            let (queue, timeout) = (sock.accept_signal.clone(), sock.accept_timeout);
            return Ok(Step::Pend(self.pend_on(id, &queue, timeout)));
        }
        // Checked first so a failed accept leaves the entry queued.
        if !self.pool.has_free() {
            return Err(SockError::PoolEmpty);
        }

        let inherit = Inherit::of(sock);
        let sock = self.pool.lookup_mut(id)?;
        let Some(queue) = sock.accept_q.as_mut() else {
            fatal_state(id, sock.state, "accept");
        };
        let conn = queue.pop_ready()?;
        if queue.has_ready() {
            sock.accept_signal.post();
        }
        sock.children += 1;

        let child = self.pool.get(inherit.family, SocketType::Stream)?;
        let peer = self.conns.remote_addr(conn).unwrap_or_default();
        self.conns.set_app(conn, Some(child))?;
        let peer_closed = self.tcp.peer_closed(conn);

        let sock = self.pool.lookup_mut(child)?;
        inherit.apply(sock);
        sock.conn = Some(conn);
        sock.parent = Some((id, inherit.generation));
        sock.set_state(if peer_closed {
            SockState::ClosingDataAvail
        } else {
            SockState::Conn
        });
        log::debug!("sock {}: accepted {} as sock {}", id.0, peer, child.0);

        if inherit.flags.contains(SockFlags::SECURE) {
            if let Some(hooks) = self.secure {
                if let Err(e) = hooks.accept(id, child, peer) {
                    log::warn!("sock {}: secure accept from {} failed: {}", id.0, peer, e);
                    self.abort_socket(child);
                    return Err(e);
                }
            }
        }
        Ok(Step::Done((child, peer)))
    }

    pub(crate) fn stream_recv(
        &mut self,
        id: SockId,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<Step<Recv>, SockError> {
        let no_block = self.no_block(id, flags)?;
        let sock = self.pool.lookup(id)?;
        let state = sock.state;
        match state {
            SockState::Conn | SockState::ClosingDataAvail => {}
            SockState::ConnDone => self.stream_promote(id)?,
            SockState::ConnInProgress => {
                if no_block {
                    return Err(SockError::WouldBlock);
                }
                let (queue, timeout) = (sock.conn_signal.clone(), sock.conn_req_timeout);
                return Ok(Step::Pend(self.pend_on(id, &queue, timeout)));
            }
            SockState::CloseInProgress => return Ok(Step::Done(Recv::Closed)),
            SockState::Closed | SockState::Bound | SockState::Listen => {
                return Err(SockError::InvalidState)
            }
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            SockState::Free => fatal_state(id, sock.state, "recv"),
        }

        let sock = self.pool.lookup(id)?;
        let Some(conn) = sock.conn else {
            fatal_state(id, sock.state, "recv");
        };
        let peek = flags.contains(MsgFlags::PEEK);
        let len = self.tcp.recv(conn, buf, peek, &mut self.wire)?;
        if len > 0 {
            let from = self.conns.remote_addr(conn);
            if peek || self.tcp.rx_available(conn) > 0 {
                sock.rx_signal.post();
            }
            return Ok(Step::Done(Recv::Data {
                len,
                from,
                truncated: false,
            }));
        }
        if self.tcp.peer_closed(conn) {
            return Ok(Step::Done(Recv::Closed));
        }
        if no_block {
            return Err(SockError::WouldBlock);
        }
        let (queue, timeout) = (sock.rx_signal.clone(), sock.rx_timeout);
        Ok(Step::Pend(self.pend_on(id, &queue, timeout)))
    }

    /// Queue `data[*queued..]`; `queued` carries progress across retries.
    pub(crate) fn stream_send(
        &mut self,
        id: SockId,
        data: &[u8],
        flags: MsgFlags,
        queued: &mut usize,
    ) -> Result<Step<Sent>, SockError> {
        let no_block = self.no_block(id, flags)?;
        let sock = self.pool.lookup(id)?;
        let state = sock.state;
        match state {
            SockState::Conn => {}
            SockState::ConnDone => self.stream_promote(id)?,
            // Octets queued before the connection went away are still reported.
            SockState::ClosingDataAvail | SockState::CloseInProgress | SockState::ClosedFault
                if *queued > 0 =>
            {
                return Ok(Step::Done(Sent::Bytes(*queued)));
            }
            SockState::ClosingDataAvail | SockState::CloseInProgress => {
                return Ok(Step::Done(Sent::Closed))
            }
            SockState::ConnInProgress => {
                if no_block {
                    return Err(SockError::WouldBlock);
                }
                let (queue, timeout) = (sock.conn_signal.clone(), sock.conn_req_timeout);
                return Ok(Step::Pend(self.pend_on(id, &queue, timeout)));
            }
            SockState::Closed | SockState::Bound | SockState::Listen => {
                return Err(SockError::InvalidState)
            }
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            SockState::Free => fatal_state(id, sock.state, "send"),
        }
        if data.is_empty() {
            return Ok(Step::Done(Sent::Bytes(0)));
        }

        let sock = self.pool.lookup(id)?;
        let Some(conn) = sock.conn else {
            fatal_state(id, sock.state, "send");
        };
        let tx_timeout = sock.tx_timeout;
        *queued += self.tcp.send(conn, &data[*queued..], &mut self.wire)?;
        if *queued == data.len() || (no_block && *queued > 0) {
            return Ok(Step::Done(Sent::Bytes(*queued)));
        }
        if no_block {
            return Err(SockError::WouldBlock);
        }
        let queue = self.tcp.tx_waiter(conn).ok_or(SockError::ConnFault)?;
        Ok(Step::Pend(self.pend_on(id, &queue, tx_timeout)))
    }

    pub(crate) fn stream_close(&mut self, id: SockId) -> Result<Step<()>, SockError> {
        let no_block = self.no_block(id, MsgFlags::empty())?;
        let sock = self.pool.lookup(id)?;
        let state = sock.state;
        match state {
            SockState::Closed
            | SockState::Bound
            | SockState::ConnInProgress
            | SockState::Listen
            | SockState::ClosedFault => {
                self.abort_socket(id);
                Ok(Step::Done(()))
            }
            SockState::Conn | SockState::ConnDone | SockState::ClosingDataAvail => {
                let Some(conn) = sock.conn else {
                    fatal_state(id, sock.state, "close");
                };
                if sock.flags.contains(SockFlags::SECURE) {
                    if let Some(hooks) = self.secure {
                        hooks.close_notify(id);
                    }
                }
                let immediate = no_block || sock.close_timeout.is_no_wait();
                if let Err(e) = self.tcp.close(conn, &mut self.wire) {
                    log::debug!("sock {}: close on dead connection: {:?}", id.0, e);
                    self.free_socket(id);
                    return Ok(Step::Done(()));
                }
                if immediate || self.tcp.close_complete(conn) {
                    self.free_socket(id);
                    return Ok(Step::Done(()));
                }
                let sock = self.pool.lookup_mut(id)?;
                sock.set_state(SockState::CloseInProgress);
                let (queue, timeout) = (sock.close_signal.clone(), sock.close_timeout);
                Ok(Step::Pend(self.pend_on(id, &queue, timeout)))
            }
            SockState::CloseInProgress => {
                let done = sock.conn.map_or(true, |c| self.tcp.close_complete(c));
                if done {
                    self.free_socket(id);
                    return Ok(Step::Done(()));
                }
                let (queue, timeout) = (sock.close_signal.clone(), sock.close_timeout);
                Ok(Step::Pend(self.pend_on(id, &queue, timeout)))
            }
            SockState::Free => fatal_state(id, sock.state, "close"),
        }
    }

    /// Reset every connection still queued on listener `id`.
    pub(crate) fn abort_pending_children(&mut self, id: SockId) {
        let pending: Vec<ConnId> = match self.pool.lookup_mut(id) {
            Ok(sock) => sock
                .accept_q
                .as_mut()
                .map(|q| q.drain().map(|e| e.conn).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        for conn in pending {
            self.tcp.abort(conn, &mut self.wire);
            self.conns.close(conn);
        }
    }
}

/// Listener attributes copied to an accepted child.
struct Inherit {
    family: ProtocolFamily,
    generation: u32,
    flags: SockFlags,
    rx_q_max: usize,
    tx_q_max: usize,
    rx_timeout: Timeout,
    tx_timeout: Timeout,
    close_timeout: Timeout,
    keep_alive: bool,
    no_delay: bool,
}

impl Inherit {
    fn of(sock: &Socket) -> Self {
        Inherit {
            family: sock.family,
            generation: sock.generation,
            flags: sock.flags & SockFlags::SECURE,
            rx_q_max: sock.rx_q_max,
            tx_q_max: sock.tx_q_max,
            rx_timeout: sock.rx_timeout,
            tx_timeout: sock.tx_timeout,
            close_timeout: sock.close_timeout,
            keep_alive: sock.keep_alive,
            no_delay: sock.no_delay,
        }
    }

    fn apply(&self, sock: &mut Socket) {
        sock.flags |= self.flags;
        sock.rx_q_max = self.rx_q_max;
        sock.tx_q_max = self.tx_q_max;
        sock.rx_timeout = self.rx_timeout;
        sock.tx_timeout = self.tx_timeout;
        sock.close_timeout = self.close_timeout;
        sock.keep_alive = self.keep_alive;
        sock.no_delay = self.no_delay;
    }
}

#[cfg(test)]
mod tests {
    use crate::addr::{ProtocolFamily, SockAddr, SocketType};
    use crate::config::SockConfig;
    use crate::error::SockError;
    use crate::pool::{SockId, SockState};
    use crate::stack::{MsgFlags, NetStack, Recv, Sent};

    fn stack() -> NetStack {
        NetStack::new(SockConfig::default()).unwrap()
    }

    fn listener(s: &NetStack, port: u16, backlog: Option<usize>) -> SockId {
        let id = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        s.bind(id, &SockAddr::localhost(port)).unwrap();
        s.listen(id, backlog).unwrap();
        id
    }

    fn client(s: &NetStack, port: u16) -> SockId {
        let id = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        s.connect(id, &SockAddr::localhost(port)).unwrap();
        id
    }

    #[test]
    fn test_connect_accept_exchange() {
        let s = stack();
        let l = listener(&s, 8080, None);
        let c = client(&s, 8080);
        assert_eq!(s.state(c), Ok(SockState::Conn));

        let (child, peer) = s.accept(l).unwrap();
        assert_eq!(peer, s.local_addr(c).unwrap());
        assert_eq!(s.peer_addr(child), Ok(SockAddr::localhost(8080)));

        assert_eq!(s.send(c, b"data1", MsgFlags::empty()), Ok(Sent::Bytes(5)));
        assert_eq!(s.send(c, b"data2", MsgFlags::empty()), Ok(Sent::Bytes(5)));
        let mut buf = [0u8; 32];
        let got = s.recv(child, &mut buf, MsgFlags::DONTWAIT).unwrap();
        assert!(matches!(got, Recv::Data { len: 10, .. }));
        assert_eq!(&buf[..10], b"data1data2");
    }

    #[test]
    fn test_connect_refused_without_listener() {
        let s = stack();
        let c = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        assert_eq!(
            s.connect(c, &SockAddr::localhost(9)),
            Err(SockError::ConnRefused)
        );
        assert_eq!(s.state(c), Ok(SockState::ClosedFault));
        s.close(c).unwrap();
    }

    #[test]
    fn test_listen_requires_bound_stream() {
        let s = stack();
        let d = s.open(ProtocolFamily::Inet4, SocketType::Datagram, None).unwrap();
        s.bind(d, &SockAddr::localhost(8100)).unwrap();
        assert_eq!(s.listen(d, None), Err(SockError::InvalidType));

        let t = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        assert_eq!(s.listen(t, None), Err(SockError::InvalidState));
        assert_eq!(s.state(t), Ok(SockState::Closed));
        s.bind(t, &SockAddr::localhost(8101)).unwrap();
        assert_eq!(s.listen(t, Some(0)), Err(SockError::InvalidArgument));
        assert_eq!(s.listen(t, Some(2)), Ok(()));
        assert_eq!(s.listen(t, Some(2)), Ok(()));
    }

    #[test]
    fn test_accept_queue_overflow_drops_requests() {
        let s = stack();
        let l = listener(&s, 8200, Some(2));
        let nb = |id| {
            s.set_option(id, crate::options::SockOpt::NonBlocking(true)).unwrap();
            id
        };
        let c: Vec<_> = (0..3)
            .map(|_| nb(s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap()))
            .collect();
        for &id in &c {
            assert_eq!(s.connect(id, &SockAddr::localhost(8200)), Err(SockError::InProgress));
        }
        assert_eq!(s.state(c[0]), Ok(SockState::ConnDone));
        assert_eq!(s.state(c[1]), Ok(SockState::ConnDone));
        assert_eq!(s.state(c[2]), Ok(SockState::ConnInProgress));

        assert!(s.accept(l).is_ok());
        assert!(s.accept(l).is_ok());
        s.set_option(l, crate::options::SockOpt::NonBlocking(true)).unwrap();
        assert_eq!(s.accept(l), Err(SockError::WouldBlock));
    }

    #[test]
    fn test_graceful_close_reports_eof() {
        let s = stack();
        let l = listener(&s, 8300, None);
        let c = client(&s, 8300);
        let (child, _) = s.accept(l).unwrap();

        s.send(c, b"bye", MsgFlags::empty()).unwrap();
        s.set_option(c, crate::options::SockOpt::NonBlocking(true)).unwrap();
        s.close(c).unwrap();
        assert_eq!(s.close(c), Err(SockError::InvalidHandle));

        assert_eq!(s.state(child), Ok(SockState::ClosingDataAvail));
        let mut buf = [0u8; 8];
        assert!(matches!(
            s.recv(child, &mut buf, MsgFlags::empty()),
            Ok(Recv::Data { len: 3, .. })
        ));
        assert_eq!(s.recv(child, &mut buf, MsgFlags::empty()), Ok(Recv::Closed));
        assert_eq!(s.send(child, b"x", MsgFlags::empty()), Ok(Sent::Closed));
        s.close(child).unwrap();
        s.close(l).unwrap();
        assert_eq!(s.stats().conns_in_use, 0);
        assert_eq!(s.pool_stats().in_use, 0);
    }

    #[test]
    fn test_blocking_close_waits_for_ack() {
        let s = stack();
        let l = listener(&s, 8400, None);
        let c = client(&s, 8400);
        let (child, _) = s.accept(l).unwrap();
        // The peer acknowledges the FIN within the same wire pass.
        s.close(child).unwrap();
        assert_eq!(s.state(c), Ok(SockState::ClosingDataAvail));
        s.close(c).unwrap();
        s.close(l).unwrap();
        assert_eq!(s.stats().conns_in_use, 0);
    }

    #[test]
    fn test_close_all_aborts_everything() {
        let s = stack();
        let l = listener(&s, 8500, None);
        let c = client(&s, 8500);
        let (child, _) = s.accept(l).unwrap();
        s.close_all();
        for id in [l, c, child] {
            assert_eq!(s.state(id), Err(SockError::InvalidHandle));
        }
        assert_eq!(s.pool_stats().in_use, 0);
        assert_eq!(s.stats().conns_in_use, 0);
    }

    #[test]
    fn test_listener_close_resets_pending() {
        let s = stack();
        let l = listener(&s, 8600, None);
        let c = client(&s, 8600);
        s.close(l).unwrap();
        assert_eq!(s.state(c), Ok(SockState::ClosedFault));
        let mut buf = [0u8; 4];
        assert_eq!(
            s.recv(c, &mut buf, MsgFlags::DONTWAIT),
            Err(SockError::ConnFault)
        );
        assert_eq!(
            s.get_option(c, crate::options::SockOptName::Error),
            Ok(crate::options::SockOpt::Error(Some(SockError::ConnFault)))
        );
        s.close(c).unwrap();
    }

    #[test]
    fn test_recv_before_connect_is_invalid_state() {
        let s = stack();
        let id = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            s.recv(id, &mut buf, MsgFlags::DONTWAIT),
            Err(SockError::InvalidState)
        );
        assert_eq!(
            s.send(id, b"x", MsgFlags::DONTWAIT),
            Err(SockError::InvalidState)
        );
        assert_eq!(s.state(id), Ok(SockState::Closed));
    }
}
