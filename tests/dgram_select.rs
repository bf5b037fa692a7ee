use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netsock::{
    register_std_wait_hooks, MsgFlags, NetStack, ProtocolFamily, Recv, SockAddr, SockConfig,
    SockDescSet, SockError, SockId, SockOpt, SocketType, Timeout,
};

fn stack() -> Arc<NetStack> {
    register_std_wait_hooks();
    Arc::new(NetStack::new(SockConfig::default()).unwrap())
}

fn udp(s: &NetStack, port: u16) -> SockId {
    let id = s.open(ProtocolFamily::Inet4, SocketType::Datagram, None).unwrap();
    s.bind(id, &SockAddr::localhost(port)).unwrap();
    id
}

#[test]
fn pool_hands_out_disjoint_handles() {
    register_std_wait_hooks();
    let cfg = SockConfig {
        sock_count: 8,
        ..SockConfig::default()
    };
    let s = NetStack::new(cfg).unwrap();
    let ids: Vec<SockId> = (0..8)
        .map(|_| s.open(ProtocolFamily::Inet4, SocketType::Datagram, None).unwrap())
        .collect();
    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 8);
    assert_eq!(
        s.open(ProtocolFamily::Inet4, SocketType::Stream, None),
        Err(SockError::PoolEmpty)
    );
    for id in ids {
        s.close(id).unwrap();
        assert_eq!(s.close(id), Err(SockError::InvalidHandle));
    }
    assert_eq!(s.pool_stats().in_use, 0);
    assert_eq!(s.pool_stats().max_used, 8);
}

#[test]
fn datagram_truncation_never_continues() {
    let s = stack();
    let rx = udp(&s, 6001);
    let tx = udp(&s, 6002);
    let dst = SockAddr::localhost(6001);
    s.send_to(tx, b"0123456789", MsgFlags::empty(), Some(&dst)).unwrap();
    s.send_to(tx, b"abc", MsgFlags::empty(), Some(&dst)).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(
        s.recv_from(rx, &mut buf, MsgFlags::empty()),
        Ok(Recv::Data {
            len: 4,
            from: Some(SockAddr::localhost(6002)),
            truncated: true
        })
    );
    assert_eq!(&buf, b"0123");
    assert!(matches!(
        s.recv_from(rx, &mut buf, MsgFlags::empty()),
        Ok(Recv::Data { len: 3, truncated: false, .. })
    ));
    assert_eq!(&buf[..3], b"abc");
}

#[test]
fn blocking_recv_woken_by_other_thread() {
    let s = stack();
    let rx = udp(&s, 6003);
    let tx = udp(&s, 6004);
    let sender = {
        let s = s.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            s.send_to(tx, b"wake", MsgFlags::empty(), Some(&SockAddr::localhost(6003)))
        })
    };
    let mut buf = [0u8; 8];
    assert!(matches!(
        s.recv_from(rx, &mut buf, MsgFlags::empty()),
        Ok(Recv::Data { len: 4, .. })
    ));
    sender.join().unwrap().unwrap();
}

#[test]
fn recv_timeout_expires() {
    let s = stack();
    let rx = udp(&s, 6005);
    s.set_option(rx, SockOpt::RxTimeout(Timeout::Ms(50))).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(
        s.recv_from(rx, &mut buf, MsgFlags::empty()),
        Err(SockError::Timeout)
    );
}

#[test]
fn injected_datagram_reaches_socket() {
    let s = stack();
    let rx = udp(&s, 6006);
    let from = SockAddr::new("10.0.0.7".parse().unwrap(), 4000);
    s.inject_datagram(from, SockAddr::localhost(6006), b"driver").unwrap();
    s.inject_datagram(from, SockAddr::localhost(6999), b"nobody").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(
        s.recv_from(rx, &mut buf, MsgFlags::DONTWAIT),
        Ok(Recv::Data {
            len: 6,
            from: Some(from),
            truncated: false
        })
    );
    assert_eq!(s.stats().udp.no_listener, 1);
}

#[test]
fn select_reports_current_readiness() {
    let s = stack();
    let quiet = udp(&s, 6010);
    let busy = udp(&s, 6011);
    s.send_to(quiet, b"x", MsgFlags::empty(), Some(&SockAddr::localhost(6011)))
        .unwrap();

    let l = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
    s.bind(l, &SockAddr::localhost(6012)).unwrap();
    s.listen(l, None).unwrap();
    let c = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
    s.connect(c, &SockAddr::localhost(6012)).unwrap();

    let mut rd: SockDescSet = [quiet, busy, l, c].into_iter().collect();
    let mut wr: SockDescSet = [quiet, c].into_iter().collect();
    let n = s
        .select(Some(&mut rd), Some(&mut wr), None, Timeout::NoWait)
        .unwrap();
    assert_eq!(n, 4);
    assert!(rd.is_set(busy));
    assert!(rd.is_set(l));
    assert!(!rd.is_set(quiet));
    assert!(!rd.is_set(c));
    assert!(wr.is_set(quiet));
    assert!(wr.is_set(c));
}

#[test]
fn select_woken_by_inbound_datagram() {
    let s = stack();
    let rx = udp(&s, 6020);
    let tx = udp(&s, 6021);
    let sender = {
        let s = s.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            s.send_to(tx, b"ping", MsgFlags::empty(), Some(&SockAddr::localhost(6020)))
        })
    };
    let mut rd: SockDescSet = [rx].into_iter().collect();
    assert_eq!(s.select(Some(&mut rd), None, None, Timeout::Ms(5000)), Ok(1));
    assert!(rd.is_set(rx));
    sender.join().unwrap().unwrap();
}

#[test]
fn select_woken_by_incoming_connection() {
    let s = stack();
    let l = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
    s.bind(l, &SockAddr::localhost(6060)).unwrap();
    s.listen(l, None).unwrap();
    let connector = {
        let s = s.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let c = s.open(ProtocolFamily::Inet4, SocketType::Stream, None)?;
            s.connect(c, &SockAddr::localhost(6060))
        })
    };
    let mut rd: SockDescSet = [l].into_iter().collect();
    assert_eq!(s.select(Some(&mut rd), None, None, Timeout::Ms(5000)), Ok(1));
    assert!(rd.is_set(l));
    connector.join().unwrap().unwrap();
    assert!(s.accept(l).is_ok());
}

#[test]
fn select_times_out_and_clears_sets() {
    let s = stack();
    let rx = udp(&s, 6030);
    let mut rd: SockDescSet = [rx].into_iter().collect();
    assert_eq!(
        s.select(Some(&mut rd), None, None, Timeout::Ms(30)),
        Err(SockError::Timeout)
    );
    assert!(rd.is_empty());
}

#[test]
fn close_aborts_pending_select() {
    let s = stack();
    let rx = udp(&s, 6040);
    let waiter = {
        let s = s.clone();
        thread::spawn(move || {
            let mut rd: SockDescSet = [rx].into_iter().collect();
            s.select(Some(&mut rd), None, None, Timeout::Infinite)
        })
    };
    thread::sleep(Duration::from_millis(100));
    s.close(rx).unwrap();
    assert_eq!(waiter.join().unwrap(), Err(SockError::Aborted));
}

#[test]
fn select_rejects_bad_sets() {
    let s = stack();
    let rx = udp(&s, 6050);
    s.close(rx).unwrap();
    let mut rd: SockDescSet = [rx].into_iter().collect();
    assert_eq!(
        s.select(Some(&mut rd), None, None, Timeout::NoWait),
        Err(SockError::InvalidHandle)
    );
    assert_eq!(
        s.select(None, None, None, Timeout::Infinite),
        Err(SockError::InvalidArgument)
    );
    let mut big = SockDescSet::new();
    big.set(SockId(200));
    assert_eq!(
        s.select(Some(&mut big), None, None, Timeout::NoWait),
        Err(SockError::InvalidArgument)
    );
}
