use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netsock::{
    register_std_wait_hooks, MsgFlags, NetStack, ProtocolFamily, Recv, SecureHooks, Sent,
    SockAddr, SockConfig, SockError, SockId, SockOpt, SockState, SocketType, Timeout,
};

fn stack() -> Arc<NetStack> {
    register_std_wait_hooks();
    Arc::new(NetStack::new(SockConfig::default()).unwrap())
}

fn stream(s: &NetStack) -> SockId {
    s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap()
}

fn listener(s: &NetStack, port: u16) -> SockId {
    let id = stream(s);
    s.bind(id, &SockAddr::localhost(port)).unwrap();
    s.listen(id, None).unwrap();
    id
}

fn pair(s: &NetStack, port: u16) -> (SockId, SockId, SockId) {
    let l = listener(s, port);
    let c = stream(s);
    s.connect(c, &SockAddr::localhost(port)).unwrap();
    let (child, _) = s.accept(l).unwrap();
    (l, c, child)
}

#[test]
fn stream_bytes_arrive_in_order() {
    let s = stack();
    let (_, c, child) = pair(&s, 5001);
    s.send(c, b"data1", MsgFlags::empty()).unwrap();
    s.send(c, b"data2", MsgFlags::empty()).unwrap();

    let mut got = Vec::new();
    let mut buf = [0u8; 4];
    while got.len() < 10 {
        match s.recv(child, &mut buf, MsgFlags::empty()).unwrap() {
            Recv::Data { len, .. } => got.extend_from_slice(&buf[..len]),
            Recv::Closed => panic!("unexpected end of stream"),
        }
    }
    assert_eq!(got, b"data1data2");
}

#[test]
fn blocking_send_waits_for_window() {
    let s = stack();
    let l = listener(&s, 5002);
    s.set_option(l, SockOpt::RxQueueSize(64)).unwrap();
    let c = stream(&s);
    s.set_option(c, SockOpt::TxQueueSize(128)).unwrap();
    s.connect(c, &SockAddr::localhost(5002)).unwrap();
    let (child, _) = s.accept(l).unwrap();

    let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    let reader = {
        let s = s.clone();
        thread::spawn(move || {
            let mut got = Vec::new();
            let mut buf = [0u8; 48];
            while got.len() < 1000 {
                if let Recv::Data { len, .. } = s.recv(child, &mut buf, MsgFlags::empty()).unwrap() {
                    got.extend_from_slice(&buf[..len]);
                }
            }
            got
        })
    };

    assert_eq!(s.send(c, &payload, MsgFlags::empty()), Ok(Sent::Bytes(1000)));
    assert_eq!(reader.join().unwrap(), payload);
}

#[test]
fn nonblocking_send_reports_partial() {
    let s = stack();
    let l = listener(&s, 5003);
    s.set_option(l, SockOpt::RxQueueSize(16)).unwrap();
    let c = stream(&s);
    s.set_option(c, SockOpt::TxQueueSize(32)).unwrap();
    s.connect(c, &SockAddr::localhost(5003)).unwrap();
    s.accept(l).unwrap();

    assert_eq!(s.send(c, &[1; 100], MsgFlags::DONTWAIT), Ok(Sent::Bytes(32)));
    // 16 octets sit in the peer's window and 16 in the transmit queue.
    assert_eq!(s.send(c, &[1; 100], MsgFlags::DONTWAIT), Ok(Sent::Bytes(16)));
    assert_eq!(s.send(c, &[1; 100], MsgFlags::DONTWAIT), Err(SockError::WouldBlock));
}

#[test]
fn blocked_send_reports_reset_fault() {
    let s = stack();
    let l = listener(&s, 5013);
    s.set_option(l, SockOpt::RxQueueSize(16)).unwrap();
    let c = stream(&s);
    s.set_option(c, SockOpt::TxQueueSize(32)).unwrap();
    s.connect(c, &SockAddr::localhost(5013)).unwrap();
    // Never accepted: the peer window stays full.
    while s.send(c, &[7; 64], MsgFlags::DONTWAIT).is_ok() {}

    let sender = {
        let s = s.clone();
        thread::spawn(move || s.send(c, &[7; 64], MsgFlags::empty()))
    };
    thread::sleep(Duration::from_millis(100));
    s.close(l).unwrap();

    assert_eq!(sender.join().unwrap(), Err(SockError::ConnFault));
    assert_eq!(s.state(c), Ok(SockState::ClosedFault));
    s.close(c).unwrap();
}

#[test]
fn blocked_send_keeps_partial_count_after_peer_close() {
    let s = stack();
    let l = listener(&s, 5014);
    s.set_option(l, SockOpt::RxQueueSize(16)).unwrap();
    let c = stream(&s);
    s.set_option(c, SockOpt::TxQueueSize(32)).unwrap();
    s.connect(c, &SockAddr::localhost(5014)).unwrap();
    let (child, _) = s.accept(l).unwrap();

    let sender = {
        let s = s.clone();
        thread::spawn(move || s.send(c, &[3; 1000], MsgFlags::empty()))
    };
    thread::sleep(Duration::from_millis(100));
    s.set_option(child, SockOpt::NonBlocking(true)).unwrap();
    s.close(child).unwrap();

    match sender.join().unwrap() {
        Ok(Sent::Bytes(n)) => assert!((32..1000).contains(&n), "queued {}", n),
        other => panic!("expected a partial count, got {:?}", other),
    }
}

#[test]
fn nonblocking_connect_passes_through_conn_done() {
    let s = stack();
    let l = listener(&s, 5004);
    let c = stream(&s);
    s.set_option(c, SockOpt::NonBlocking(true)).unwrap();
    assert_eq!(s.connect(c, &SockAddr::localhost(5004)), Err(SockError::InProgress));
    assert_eq!(s.state(c), Ok(SockState::ConnDone));
    assert_eq!(s.is_connected(c), Ok(true));

    assert_eq!(s.send(c, b"hi", MsgFlags::empty()), Ok(Sent::Bytes(2)));
    assert_eq!(s.state(c), Ok(SockState::Conn));
    assert_eq!(
        s.connect(c, &SockAddr::localhost(5004)),
        Err(SockError::InvalidState)
    );
    let (child, peer) = s.accept(l).unwrap();
    assert_eq!(peer, s.local_addr(c).unwrap());
    let mut buf = [0u8; 4];
    assert!(matches!(
        s.recv(child, &mut buf, MsgFlags::empty()),
        Ok(Recv::Data { len: 2, .. })
    ));
}

#[test]
fn connect_refused_leaves_fault() {
    let s = stack();
    let c = stream(&s);
    assert_eq!(
        s.connect(c, &SockAddr::localhost(5999)),
        Err(SockError::ConnRefused)
    );
    assert_eq!(s.state(c), Ok(SockState::ClosedFault));
    let mut buf = [0u8; 1];
    assert_eq!(s.recv(c, &mut buf, MsgFlags::empty()), Err(SockError::ConnRefused));
    s.close(c).unwrap();
    assert_eq!(s.close(c), Err(SockError::InvalidHandle));
}

#[test]
fn rejected_calls_leave_state_unchanged() {
    let s = stack();
    let t = stream(&s);
    assert_eq!(s.listen(t, None), Err(SockError::InvalidState));
    assert_eq!(s.accept(t), Err(SockError::InvalidState));
    assert_eq!(s.state(t), Ok(SockState::Closed));

    s.bind(t, &SockAddr::localhost(5005)).unwrap();
    let other = stream(&s);
    assert_eq!(s.bind(other, &SockAddr::localhost(5005)), Err(SockError::AddrInUse));
    assert_eq!(s.state(other), Ok(SockState::Closed));

    s.listen(t, None).unwrap();
    assert_eq!(s.connect(t, &SockAddr::localhost(80)), Err(SockError::InvalidState));
    assert_eq!(s.state(t), Ok(SockState::Listen));
}

#[test]
fn close_aborts_blocked_accept() {
    let s = stack();
    let l = listener(&s, 5006);
    let waiter = {
        let s = s.clone();
        thread::spawn(move || s.accept(l))
    };
    thread::sleep(Duration::from_millis(100));
    s.close(l).unwrap();
    assert_eq!(waiter.join().unwrap(), Err(SockError::Aborted));
}

#[test]
fn close_aborts_blocked_recv() {
    let s = stack();
    let (_, _, child) = pair(&s, 5007);
    let waiter = {
        let s = s.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            s.recv(child, &mut buf, MsgFlags::empty())
        })
    };
    thread::sleep(Duration::from_millis(100));
    s.set_option(child, SockOpt::NonBlocking(true)).unwrap();
    s.close(child).unwrap();
    assert_eq!(waiter.join().unwrap(), Err(SockError::Aborted));
}

#[test]
fn accept_times_out() {
    let s = stack();
    let l = listener(&s, 5008);
    s.set_option(l, SockOpt::AcceptTimeout(Timeout::Ms(50))).unwrap();
    assert_eq!(s.accept(l), Err(SockError::Timeout));
    assert_eq!(s.state(l), Ok(SockState::Listen));
}

#[test]
fn max_children_caps_connections() {
    let s = stack();
    let l = listener(&s, 5009);
    s.set_option(l, SockOpt::MaxChildren(Some(1))).unwrap();
    let first = stream(&s);
    s.connect(first, &SockAddr::localhost(5009)).unwrap();
    s.accept(l).unwrap();

    let second = stream(&s);
    s.set_option(second, SockOpt::NonBlocking(true)).unwrap();
    assert_eq!(
        s.connect(second, &SockAddr::localhost(5009)),
        Err(SockError::InProgress)
    );
    assert_eq!(s.state(second), Ok(SockState::ConnInProgress));
}

#[test]
fn accepted_child_close_releases_slot() {
    let s = stack();
    let before = s.stats();
    let (l, c, child) = pair(&s, 5010);
    s.close(c).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(s.recv(child, &mut buf, MsgFlags::empty()), Ok(Recv::Closed));
    s.close(child).unwrap();
    s.close(l).unwrap();
    let after = s.stats();
    assert_eq!(after.pool.in_use, before.pool.in_use);
    assert_eq!(after.conns_in_use, 0);
}

struct CountingHooks {
    connects: AtomicUsize,
    accepts: AtomicUsize,
    notifies: AtomicUsize,
}

impl SecureHooks for CountingHooks {
    fn connect(&self, _sock: SockId, peer: SockAddr) -> Result<(), SockError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if peer.port == 5012 {
            return Err(SockError::ConnFault);
        }
        Ok(())
    }

    fn accept(&self, _listener: SockId, _child: SockId, _peer: SockAddr) -> Result<(), SockError> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close_notify(&self, _sock: SockId) {
        self.notifies.fetch_add(1, Ordering::SeqCst);
    }
}

static HOOKS: CountingHooks = CountingHooks {
    connects: AtomicUsize::new(0),
    accepts: AtomicUsize::new(0),
    notifies: AtomicUsize::new(0),
};

#[test]
fn secure_hooks_run_at_handshake_points() {
    let s = stack();
    s.set_secure_hooks(&HOOKS);

    let l = stream(&s);
    s.bind(l, &SockAddr::localhost(5011)).unwrap();
    s.set_option(l, SockOpt::Secure(true)).unwrap();
    s.listen(l, None).unwrap();
    assert_eq!(s.set_option(l, SockOpt::Secure(false)), Err(SockError::InvalidState));

    let c = stream(&s);
    s.set_option(c, SockOpt::Secure(true)).unwrap();
    s.connect(c, &SockAddr::localhost(5011)).unwrap();
    let (child, _) = s.accept(l).unwrap();
    assert_eq!(
        s.get_option(child, netsock::SockOptName::Secure),
        Ok(SockOpt::Secure(true))
    );
    s.close(c).unwrap();

    assert_eq!(HOOKS.connects.load(Ordering::SeqCst), 1);
    assert_eq!(HOOKS.accepts.load(Ordering::SeqCst), 1);
    assert_eq!(HOOKS.notifies.load(Ordering::SeqCst), 1);

    // A failed client handshake faults the socket.
    let l2 = listener(&s, 5012);
    let bad = stream(&s);
    s.set_option(bad, SockOpt::Secure(true)).unwrap();
    assert_eq!(
        s.connect(bad, &SockAddr::localhost(5012)),
        Err(SockError::ConnFault)
    );
    assert_eq!(s.state(bad), Ok(SockState::ClosedFault));
    s.close(bad).unwrap();
    s.close(l2).unwrap();
}
