//! Stream engine.
//!
//! One transmission control block (TCB) per registry connection, driven by
//! socket calls from above and by [`Segment`]s from the loopback wire.
//!
//! # State Machine
//!
//! ```text
//!   CLOSED --connect--> SYN-SENT --rcv SYN-ACK / snd ACK--> ESTABLISHED
//!   CLOSED --listen---> LISTEN   (SYNs spawn children in SYN-RECEIVED)
//!   SYN-RECEIVED --rcv ACK--> ESTABLISHED
//!
//!   ESTABLISHED --close / snd FIN--> FIN-WAIT-1 --rcv FIN-ACK--> FIN-WAIT-2
//!   FIN-WAIT-2  --rcv FIN / snd FIN-ACK--> (released)
//!   FIN-WAIT-1  --rcv FIN / snd FIN-ACK--> CLOSING --rcv FIN-ACK--> (released)
//!   ESTABLISHED --rcv FIN / snd FIN-ACK--> CLOSE-WAIT
//!   CLOSE-WAIT  --close / snd FIN--> LAST-ACK --rcv FIN-ACK--> (released)
//!   any --rcv RST--> (released, Reset)
//! ```
//!
//! No retransmission and no TIME-WAIT: the wire is lossless. The FIN is held
//! back until the transmit queue drains, so a graceful close never discards
//! queued data.
//!
//! Flow control uses window right edges (see [`crate::wire`]); the transmit
//! queue absorbs anything beyond the peer's window and the connection's
//! transmit-ready signal is posted whenever queued octets leave for the wire.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::addr::SockAddr;
use crate::conn::ConnId;
use crate::wait::WaitQueue;
use crate::wire::{Segment, Wire};

/// Largest payload per data segment.
pub const TCP_MSS: usize = 1460;

// ============================================================================
// Types
// ============================================================================

/// TCP connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Opened, not yet connecting or listening
    Closed,
    /// Waiting for connection requests
    Listen,
    /// SYN sent, waiting for SYN-ACK
    SynSent,
    /// SYN-ACK sent, waiting for ACK
    SynReceived,
    /// Open connection, data can be exchanged
    Established,
    /// Local FIN sent, not yet acknowledged
    FinWait1,
    /// Local FIN acknowledged, waiting for the peer's FIN
    FinWait2,
    /// Peer FIN received, waiting for the local close
    CloseWait,
    /// Both FINs sent, ours not yet acknowledged
    Closing,
    /// Local FIN sent after the peer's, waiting for acknowledgment
    LastAck,
}

impl TcpState {
    /// Check if the connection is in an established or semi-established state
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Check if the connection can receive data
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }
}

/// Stream engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// No TCB for the connection (never opened, reset, or released)
    NoTcb,
    /// Operation not valid in the TCB state
    InvalidState,
    /// Local close already requested
    Closing,
}

/// Notifications for the socket layer, drained after every input burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    /// Active open completed
    Connected(ConnId),
    /// Passive open completed (child of a listener)
    Established(ConnId),
    /// Receive data queued
    DataReady(ConnId),
    /// Transmit queue gained room
    TxReady(ConnId),
    /// Peer sent FIN
    PeerClosed(ConnId),
    /// Local FIN acknowledged
    CloseComplete(ConnId),
    /// Connection refused or reset; the TCB is gone
    Reset(ConnId),
    /// Connection finished gracefully; the TCB is gone
    Released(ConnId),
}

/// Transmission control block.
struct Tcb {
    state: TcpState,
    local: SockAddr,
    remote: Option<SockAddr>,
    /// Listening connection that spawned this one
    listener: Option<ConnId>,

    rx_buf: VecDeque<u8>,
    rx_cap: usize,
    read_total: u64,
    adv_edge: u64,

    tx_q: VecDeque<u8>,
    tx_cap: usize,
    sent_total: u64,
    peer_edge: u64,

    fin_pending: bool,
    fin_sent: bool,
    fin_acked: bool,
    peer_fin: bool,
    /// Owning socket is gone; received data is discarded
    detached: bool,

    keep_alive: bool,
    no_delay: bool,
    tx_ready: Arc<WaitQueue>,
}

impl Tcb {
    fn new(local: SockAddr, rx_cap: usize, tx_cap: usize) -> Self {
        Tcb {
            state: TcpState::Closed,
            local,
            remote: None,
            listener: None,
            rx_buf: VecDeque::new(),
            rx_cap,
            read_total: 0,
            adv_edge: 0,
            tx_q: VecDeque::new(),
            tx_cap,
            sent_total: 0,
            peer_edge: 0,
            fin_pending: false,
            fin_sent: false,
            fin_acked: false,
            peer_fin: false,
            detached: false,
            keep_alive: false,
            no_delay: false,
            tx_ready: Arc::new(WaitQueue::new()),
        }
    }

    /// Right edge of the receive window; never moves left.
    fn rx_edge(&mut self) -> u64 {
        self.adv_edge = self.adv_edge.max(self.read_total + self.rx_cap as u64);
        self.adv_edge
    }

    fn segment(&self, wire: &mut Wire, seg: Segment) {
        if let Some(remote) = self.remote {
            wire.push_segment(self.local, remote, seg);
        }
    }

    /// Move queued octets inside the peer's window onto the wire, then the
    /// FIN once the queue is empty.
    fn flush(&mut self, conn: ConnId, wire: &mut Wire, events: &mut VecDeque<TcpEvent>) {
        let Some(remote) = self.remote else { return };
        let mut moved = false;
        while !self.tx_q.is_empty() {
            let window = self.peer_edge.saturating_sub(self.sent_total) as usize;
            if window == 0 {
                break;
            }
            let n = self.tx_q.len().min(window).min(TCP_MSS);
            let payload: Vec<u8> = self.tx_q.drain(..n).collect();
            self.sent_total += n as u64;
            let edge = self.rx_edge();
            wire.push_segment(self.local, remote, Segment::Data { edge, payload });
            moved = true;
        }
        if moved {
            self.tx_ready.post();
            events.push_back(TcpEvent::TxReady(conn));
        }
        if self.fin_pending && self.tx_q.is_empty() && !self.fin_sent {
            self.fin_sent = true;
            wire.push_segment(self.local, remote, Segment::Fin);
            self.state = match self.state {
                TcpState::CloseWait => TcpState::LastAck,
                _ => TcpState::FinWait1,
            };
            log::trace!("tcp: {:?} FIN sent -> {:?}", conn, self.state);
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// All TCBs plus the pending event queue.
#[derive(Default)]
pub struct TcpEngine {
    tcbs: BTreeMap<ConnId, Tcb>,
    events: VecDeque<TcpEvent>,
}

impl TcpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a TCB in `Closed` for a bound connection.
    pub fn open(
        &mut self,
        conn: ConnId,
        local: SockAddr,
        rx_cap: usize,
        tx_cap: usize,
    ) -> Result<(), TcpError> {
        if self.tcbs.contains_key(&conn) {
            return Err(TcpError::InvalidState);
        }
        self.tcbs.insert(conn, Tcb::new(local, rx_cap, tx_cap));
        Ok(())
    }

    /// Passive open.
    pub fn listen(&mut self, conn: ConnId) -> Result<(), TcpError> {
        let tcb = self.tcbs.get_mut(&conn).ok_or(TcpError::NoTcb)?;
        match tcb.state {
            TcpState::Closed | TcpState::Listen => {
                tcb.state = TcpState::Listen;
                Ok(())
            }
            _ => Err(TcpError::InvalidState),
        }
    }

    /// Active open: send SYN from `local` to `remote`.
    ///
    /// `local` replaces the bound address so that a wildcard bind picks up
    /// the concrete source address chosen for the route.
    pub fn connect(
        &mut self,
        conn: ConnId,
        local: SockAddr,
        remote: SockAddr,
        wire: &mut Wire,
    ) -> Result<(), TcpError> {
        let tcb = self.tcbs.get_mut(&conn).ok_or(TcpError::NoTcb)?;
        if tcb.state != TcpState::Closed {
            return Err(TcpError::InvalidState);
        }
        tcb.local = local;
        tcb.remote = Some(remote);
        tcb.state = TcpState::SynSent;
        let edge = tcb.rx_edge();
        tcb.segment(wire, Segment::Syn { edge });
        log::trace!("tcp: {:?} SYN {} -> {}", conn, tcb.local, remote);
        Ok(())
    }

    /// Create a child of `listener` for an admitted SYN and answer SYN-ACK.
    #[allow(clippy::too_many_arguments)]
    pub fn accept_syn(
        &mut self,
        listener: ConnId,
        child: ConnId,
        local: SockAddr,
        remote: SockAddr,
        peer_edge: u64,
        rx_cap: usize,
        tx_cap: usize,
        wire: &mut Wire,
    ) -> Result<(), TcpError> {
        if self.tcbs.contains_key(&child) {
            return Err(TcpError::InvalidState);
        }
        let (keep_alive, no_delay) = match self.tcbs.get(&listener) {
            Some(l) if l.state == TcpState::Listen => (l.keep_alive, l.no_delay),
            Some(_) => return Err(TcpError::InvalidState),
            None => return Err(TcpError::NoTcb),
        };
        let mut tcb = Tcb::new(local, rx_cap, tx_cap);
        tcb.state = TcpState::SynReceived;
        tcb.remote = Some(remote);
        tcb.listener = Some(listener);
        tcb.peer_edge = peer_edge;
        tcb.keep_alive = keep_alive;
        tcb.no_delay = no_delay;
        let edge = tcb.rx_edge();
        tcb.segment(wire, Segment::SynAck { edge });
        self.tcbs.insert(child, tcb);
        log::trace!("tcp: {:?} SYN-ACK {} -> {} (listener {:?})", child, local, remote, listener);
        Ok(())
    }

    /// Process one inbound segment for `conn`.
    pub fn input(&mut self, conn: ConnId, seg: Segment, wire: &mut Wire) {
        if seg == Segment::Rst {
            if let Some(tcb) = self.tcbs.remove(&conn) {
                tcb.tx_ready.abort();
                log::debug!("tcp: {:?} reset in {:?}", conn, tcb.state);
                self.events.push_back(TcpEvent::Reset(conn));
            }
            return;
        }

        let Some(tcb) = self.tcbs.get_mut(&conn) else {
            return;
        };
        let events = &mut self.events;
        let mut release = false;

        match (tcb.state, seg) {
            (TcpState::SynSent, Segment::SynAck { edge }) => {
                tcb.peer_edge = tcb.peer_edge.max(edge);
                tcb.state = TcpState::Established;
                let edge = tcb.rx_edge();
                tcb.segment(wire, Segment::Ack { edge });
                events.push_back(TcpEvent::Connected(conn));
            }
            (TcpState::SynReceived, Segment::Ack { edge }) => {
                tcb.peer_edge = tcb.peer_edge.max(edge);
                tcb.state = TcpState::Established;
                events.push_back(TcpEvent::Established(conn));
            }
            (state, Segment::Data { edge, payload }) if state.can_receive() => {
                tcb.peer_edge = tcb.peer_edge.max(edge);
                if tcb.detached {
                    tcb.read_total += payload.len() as u64;
                    let edge = tcb.rx_edge();
                    tcb.segment(wire, Segment::Window { edge });
                } else if !payload.is_empty() {
                    tcb.rx_buf.extend(payload);
                    events.push_back(TcpEvent::DataReady(conn));
                }
                tcb.flush(conn, wire, events);
            }
            (_, Segment::Window { edge }) | (_, Segment::Ack { edge }) => {
                tcb.peer_edge = tcb.peer_edge.max(edge);
                tcb.flush(conn, wire, events);
            }
            (TcpState::Established, Segment::Fin) => {
                tcb.peer_fin = true;
                tcb.state = TcpState::CloseWait;
                tcb.segment(wire, Segment::FinAck);
                events.push_back(TcpEvent::PeerClosed(conn));
            }
            (TcpState::FinWait1, Segment::Fin) => {
                tcb.peer_fin = true;
                tcb.state = TcpState::Closing;
                tcb.segment(wire, Segment::FinAck);
                events.push_back(TcpEvent::PeerClosed(conn));
            }
            (TcpState::FinWait2, Segment::Fin) => {
                tcb.peer_fin = true;
                tcb.segment(wire, Segment::FinAck);
                events.push_back(TcpEvent::PeerClosed(conn));
                release = true;
            }
            (TcpState::FinWait1, Segment::FinAck) => {
                tcb.fin_acked = true;
                tcb.state = TcpState::FinWait2;
                events.push_back(TcpEvent::CloseComplete(conn));
            }
            (TcpState::Closing | TcpState::LastAck, Segment::FinAck) => {
                tcb.fin_acked = true;
                events.push_back(TcpEvent::CloseComplete(conn));
                release = true;
            }
            (state, seg) => {
                log::trace!("tcp: {:?} ignoring {:?} in {:?}", conn, seg, state);
            }
        }

        if release {
            self.release(conn);
        }
    }

    /// Queue `data` for transmit, up to the transmit ceiling.
    ///
    /// # Returns
    ///
    /// Octets accepted; zero when the queue is full.
    pub fn send(&mut self, conn: ConnId, data: &[u8], wire: &mut Wire) -> Result<usize, TcpError> {
        let tcb = self.tcbs.get_mut(&conn).ok_or(TcpError::NoTcb)?;
        if tcb.fin_pending {
            return Err(TcpError::Closing);
        }
        if !tcb.state.can_send() {
            return Err(TcpError::InvalidState);
        }
        let room = tcb.tx_cap.saturating_sub(tcb.tx_q.len());
        let n = room.min(data.len());
        tcb.tx_q.extend(&data[..n]);
        tcb.flush(conn, wire, &mut self.events);
        Ok(n)
    }

    /// Copy received data into `buf`; consume it unless `peek`.
    pub fn recv(
        &mut self,
        conn: ConnId,
        buf: &mut [u8],
        peek: bool,
        wire: &mut Wire,
    ) -> Result<usize, TcpError> {
        let tcb = self.tcbs.get_mut(&conn).ok_or(TcpError::NoTcb)?;
        let n = buf.len().min(tcb.rx_buf.len());
        for (dst, src) in buf.iter_mut().zip(tcb.rx_buf.iter()) {
            *dst = *src;
        }
        if !peek && n > 0 {
            tcb.rx_buf.drain(..n);
            tcb.read_total += n as u64;
            if !tcb.peer_fin {
                let edge = tcb.rx_edge();
                tcb.segment(wire, Segment::Window { edge });
            }
        }
        Ok(n)
    }

    /// Graceful close. Unconnected TCBs are removed at once; connected ones
    /// send FIN after the transmit queue drains.
    pub fn close(&mut self, conn: ConnId, wire: &mut Wire) -> Result<(), TcpError> {
        let tcb = self.tcbs.get_mut(&conn).ok_or(TcpError::NoTcb)?;
        match tcb.state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.remove(conn);
            }
            TcpState::SynReceived => {
                tcb.segment(wire, Segment::Rst);
                self.remove(conn);
            }
            TcpState::Established | TcpState::CloseWait => {
                tcb.fin_pending = true;
                tcb.flush(conn, wire, &mut self.events);
            }
            _ => {}
        }
        Ok(())
    }

    /// Abortive close: drop the TCB, resetting the peer if it knows us.
    pub fn abort(&mut self, conn: ConnId, wire: &mut Wire) {
        let Some(tcb) = self.tcbs.get(&conn) else { return };
        if !matches!(
            tcb.state,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent
        ) {
            tcb.segment(wire, Segment::Rst);
        }
        log::debug!("tcp: {:?} aborted in {:?}", conn, tcb.state);
        self.remove(conn);
    }

    /// The owning socket went away. Pending receive data is dropped and
    /// transmit waiters are aborted; the close handshake carries on.
    pub fn detach(&mut self, conn: ConnId, wire: &mut Wire) {
        let Some(tcb) = self.tcbs.get_mut(&conn) else { return };
        tcb.detached = true;
        let dropped = tcb.rx_buf.len();
        if dropped > 0 {
            tcb.rx_buf.clear();
            tcb.read_total += dropped as u64;
            if tcb.state.can_receive() {
                let edge = tcb.rx_edge();
                tcb.segment(wire, Segment::Window { edge });
            }
        }
        tcb.tx_ready.abort();
        tcb.tx_ready = Arc::new(WaitQueue::new());
    }

    pub fn pop_event(&mut self) -> Option<TcpEvent> {
        self.events.pop_front()
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn exists(&self, conn: ConnId) -> bool {
        self.tcbs.contains_key(&conn)
    }

    pub fn state(&self, conn: ConnId) -> Option<TcpState> {
        self.tcbs.get(&conn).map(|t| t.state)
    }

    /// Octets waiting to be read.
    pub fn rx_available(&self, conn: ConnId) -> usize {
        self.tcbs.get(&conn).map_or(0, |t| t.rx_buf.len())
    }

    /// True once the peer's FIN arrived.
    pub fn peer_closed(&self, conn: ConnId) -> bool {
        self.tcbs.get(&conn).is_some_and(|t| t.peer_fin)
    }

    /// Room in the transmit queue; zero when sending is not possible.
    pub fn tx_room(&self, conn: ConnId) -> usize {
        match self.tcbs.get(&conn) {
            Some(t) if t.state.can_send() && !t.fin_pending => {
                t.tx_cap.saturating_sub(t.tx_q.len())
            }
            _ => 0,
        }
    }

    /// Octets queued for transmit but not yet on the wire.
    pub fn tx_queued(&self, conn: ConnId) -> usize {
        self.tcbs.get(&conn).map_or(0, |t| t.tx_q.len())
    }

    /// True once our FIN was acknowledged or the TCB is gone.
    pub fn close_complete(&self, conn: ConnId) -> bool {
        self.tcbs.get(&conn).map_or(true, |t| t.fin_acked)
    }

    pub fn tx_waiter(&self, conn: ConnId) -> Option<Arc<WaitQueue>> {
        self.tcbs.get(&conn).map(|t| t.tx_ready.clone())
    }

    pub fn listener_of(&self, conn: ConnId) -> Option<ConnId> {
        self.tcbs.get(&conn).and_then(|t| t.listener)
    }

    // ---------------------------------------------------------------------
    // Options
    // ---------------------------------------------------------------------

    /// Resize the receive window. The advertised edge never shrinks.
    pub fn set_rx_window(&mut self, conn: ConnId, cap: usize, wire: &mut Wire) {
        if let Some(tcb) = self.tcbs.get_mut(&conn) {
            let before = tcb.adv_edge;
            tcb.rx_cap = cap;
            let edge = tcb.rx_edge();
            if edge > before && tcb.state.can_receive() {
                tcb.segment(wire, Segment::Window { edge });
            }
        }
    }

    pub fn set_tx_queue(&mut self, conn: ConnId, cap: usize) {
        if let Some(tcb) = self.tcbs.get_mut(&conn) {
            tcb.tx_cap = cap;
            if tcb.tx_q.len() < cap {
                tcb.tx_ready.post();
            }
        }
    }

    pub fn set_keep_alive(&mut self, conn: ConnId, on: bool) {
        if let Some(tcb) = self.tcbs.get_mut(&conn) {
            tcb.keep_alive = on;
        }
    }

    /// Nagle is a no-op on the loopback wire; the flag is carried for
    /// inheritance by accepted children.
    pub fn set_no_delay(&mut self, conn: ConnId, on: bool) {
        if let Some(tcb) = self.tcbs.get_mut(&conn) {
            tcb.no_delay = on;
        }
    }

    // ---------------------------------------------------------------------
    // Internal
    // ---------------------------------------------------------------------

    fn remove(&mut self, conn: ConnId) {
        if let Some(tcb) = self.tcbs.remove(&conn) {
            tcb.tx_ready.abort();
        }
    }

    fn release(&mut self, conn: ConnId) {
        self.remove(conn);
        log::trace!("tcp: {:?} released", conn);
        self.events.push_back(TcpEvent::Released(conn));
    }
}

// ============================================================================
// Tests
// ============================================================================
