//! Datagram sockets: lifecycle handlers and the atomic data path.
//!
//! Each receive returns exactly one datagram. A buffer shorter than the
//! datagram gets the leading octets and the `truncated` flag; the remainder
//! is discarded (kept when peeking). Transmit is all-or-nothing: a datagram
//! larger than the payload limit or the socket's transmit ceiling fails with
//! `WouldOverflow` and nothing is sent.

use alloc::vec::Vec;

use crate::addr::{Ipv4Addr, ProtocolFamily, SockAddr, SocketProtocol};
use crate::error::SockError;
use crate::pool::{fatal_state, Datagram, SockId, SockState};
use crate::select::{self, SelEvent};
use crate::stack::{MsgFlags, Recv, Sent, SockCore, Step};

impl SockCore {
    /// Set the default peer; auto-binds a `Closed` socket first.
    ///
    /// A connected datagram socket only receives from its peer and sends to
    /// it when no destination is given.
    pub(crate) fn dgram_connect(&mut self, id: SockId, addr: SockAddr) -> Result<(), SockError> {
        if !addr.is_routable() {
            return Err(SockError::InvalidArgument);
        }
        let sock = self.pool.lookup(id)?;
        match sock.state {
            SockState::Closed => {
                self.bind_conn(id, SockAddr::any(0))?;
            }
            SockState::Bound | SockState::Conn => {}
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            state => fatal_state(id, state, "dgram_connect"),
        }

        let sock = self.pool.lookup(id)?;
        let Some(conn) = sock.conn else {
            fatal_state(id, sock.state, "dgram_connect");
        };
        let local = self.conns.local_addr(conn).ok_or(SockError::InvalidState)?;
        if self
            .conns
            .tuple_in_use(conn, SocketProtocol::Udp, local, addr)
        {
            return Err(SockError::AddrInUse);
        }
        self.conns.set_remote_addr(conn, addr, true)?;
        self.pool.lookup_mut(id)?.set_state(SockState::Conn);
        Ok(())
    }

    /// Send one datagram to `dest`, or to the connected peer.
    pub(crate) fn dgram_send(
        &mut self,
        id: SockId,
        data: &[u8],
        dest: Option<SockAddr>,
    ) -> Result<Sent, SockError> {
        let sock = self.pool.lookup(id)?;
        let state = sock.state;
        match state {
            SockState::Closed | SockState::Bound | SockState::Conn => {}
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            state => fatal_state(id, state, "dgram_send"),
        }
        let limit = self.cfg.dgram_payload_max.min(sock.tx_q_max);
        let remote = sock.conn.and_then(|c| self.conns.remote_addr(c));

        let dst = match (state, dest, remote) {
            (SockState::Conn, None, Some(r)) => r,
            (SockState::Conn, Some(d), Some(r)) if d == r => d,
            (SockState::Conn, Some(_), _) => return Err(SockError::InvalidArgument),
            (_, Some(d), _) => d,
            (_, None, _) => return Err(SockError::InvalidArgument),
        };
        if !dst.is_routable() {
            return Err(SockError::InvalidArgument);
        }
        if data.len() > limit {
            log::debug!("sock {}: datagram of {} exceeds {}", id.0, data.len(), limit);
            return Err(SockError::WouldOverflow);
        }

        if state == SockState::Closed {
            self.bind_conn(id, SockAddr::any(0))?;
        }
        let sock = self.pool.lookup(id)?;
        let Some(conn) = sock.conn else {
            fatal_state(id, sock.state, "dgram_send");
        };
        let mut src = self.conns.local_addr(conn).ok_or(SockError::InvalidState)?;
        if src.ip.is_unspecified() {
            src.ip = Ipv4Addr::LOCALHOST;
        }
        self.udp.tx(src, dst, data, &mut self.wire)?;
        Ok(Sent::Bytes(data.len()))
    }

    /// Take (or peek at) the oldest queued datagram.
    pub(crate) fn dgram_recv(
        &mut self,
        id: SockId,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<Step<Recv>, SockError> {
        let no_block = self.no_block(id, flags)?;
        let peek = flags.contains(MsgFlags::PEEK);
        let sock = self.pool.lookup_mut(id)?;
        match sock.state {
            SockState::Bound | SockState::Conn => {}
            SockState::Closed => return Err(SockError::InvalidState),
            SockState::ClosedFault => return Err(sock.fault.unwrap_or(SockError::ConnFault)),
            state => fatal_state(id, state, "dgram_recv"),
        }

        if let Some(dg) = sock.rx_q.front() {
            let len = dg.data.len().min(buf.len());
            buf[..len].copy_from_slice(&dg.data[..len]);
            let truncated = dg.data.len() > buf.len();
            let from = dg.src;
            if !peek {
                if let Some(dg) = sock.rx_q.pop_front() {
                    sock.rx_q_octets -= dg.data.len();
                }
            }
            if !sock.rx_q.is_empty() {
                sock.rx_signal.post();
            }
            return Ok(Step::Done(Recv::Data {
                len,
                from: Some(from),
                truncated,
            }));
        }

        if no_block {
            return Err(SockError::WouldBlock);
        }
        let (queue, timeout) = (sock.rx_signal.clone(), sock.rx_timeout);
        Ok(Step::Pend(self.pend_on(id, &queue, timeout)))
    }

    /// Datagram close is always immediate.
    pub(crate) fn dgram_close(&mut self, id: SockId) -> Result<(), SockError> {
        self.pool.lookup(id)?;
        self.free_socket(id);
        Ok(())
    }

    /// Inbound datagram from the wire.
    ///
    /// The receive ceiling is enforced here: a datagram that does not fit in
    /// the remaining queue space is dropped whole.
    pub(crate) fn dgram_demux(&mut self, src: SockAddr, dst: SockAddr, data: Vec<u8>) {
        let target = self
            .conns
            .search(ProtocolFamily::Inet4, SocketProtocol::Udp, dst, Some(src))
            .and_then(|(conn, _)| self.conns.app(conn));
        let Some(id) = target else {
            log::debug!("udp: no socket for {} (from {})", dst, src);
            self.udp.record_no_listener();
            return;
        };
        let Ok(sock) = self.pool.lookup_mut(id) else {
            self.udp.record_no_listener();
            return;
        };
        if !matches!(sock.state, SockState::Bound | SockState::Conn) {
            self.udp.record_no_listener();
            return;
        }
        if sock.rx_q_octets + data.len() > sock.rx_q_max {
            log::debug!(
                "sock {}: rx queue full ({} + {} > {}), dropping",
                id.0,
                sock.rx_q_octets,
                data.len(),
                sock.rx_q_max
            );
            self.udp.record_queue_full();
            return;
        }

        let len = data.len();
        sock.rx_q_octets += len;
        sock.rx_q.push_back(Datagram { src, data });
        sock.rx_signal.post();
        select::post(sock, SelEvent::Rx);
        self.udp.record_rx(len);
    }
}
