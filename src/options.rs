//! Socket options (`getsockopt` / `setsockopt`).

use crate::addr::SocketType;
use crate::config::SOCK_Q_SIZE_MAX;
use crate::error::SockError;
use crate::pool::{SockFlags, SockId, SockState, Socket};
use crate::stack::SockCore;
use crate::wait::Timeout;

/// Option level, as in the BSD `level` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    /// `SOL_SOCKET`
    Socket,
    /// `IPPROTO_TCP`
    Tcp,
}

/// An option together with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    NonBlocking(bool),
    RxTimeout(Timeout),
    TxTimeout(Timeout),
    ConnReqTimeout(Timeout),
    AcceptTimeout(Timeout),
    CloseTimeout(Timeout),
    /// Receive ceiling in octets
    RxQueueSize(usize),
    /// Transmit ceiling in octets
    TxQueueSize(usize),
    KeepAlive(bool),
    NoDelay(bool),
    /// Cap on queued plus accepted connections of a listener
    MaxChildren(Option<usize>),
    Secure(bool),
    /// Read-only
    Type(SocketType),
    /// Read-only: the socket is listening
    AcceptConn(bool),
    /// Read-only: pending fault, cleared by reading it
    Error(Option<SockError>),
}

/// Option selector for [`NetStack::get_option`](crate::NetStack::get_option).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOptName {
    NonBlocking,
    RxTimeout,
    TxTimeout,
    ConnReqTimeout,
    AcceptTimeout,
    CloseTimeout,
    RxQueueSize,
    TxQueueSize,
    KeepAlive,
    NoDelay,
    MaxChildren,
    Secure,
    Type,
    AcceptConn,
    Error,
}

impl SockOptName {
    pub fn level(self) -> OptLevel {
        match self {
            SockOptName::KeepAlive | SockOptName::NoDelay | SockOptName::MaxChildren => {
                OptLevel::Tcp
            }
            _ => OptLevel::Socket,
        }
    }

    /// Stream-only options fail with `InvalidType` on datagram sockets.
    fn stream_only(self) -> bool {
        matches!(
            self,
            SockOptName::KeepAlive
                | SockOptName::NoDelay
                | SockOptName::MaxChildren
                | SockOptName::Secure
        )
    }
}

impl SockOpt {
    pub fn name(&self) -> SockOptName {
        match self {
            SockOpt::NonBlocking(_) => SockOptName::NonBlocking,
            SockOpt::RxTimeout(_) => SockOptName::RxTimeout,
            SockOpt::TxTimeout(_) => SockOptName::TxTimeout,
            SockOpt::ConnReqTimeout(_) => SockOptName::ConnReqTimeout,
            SockOpt::AcceptTimeout(_) => SockOptName::AcceptTimeout,
            SockOpt::CloseTimeout(_) => SockOptName::CloseTimeout,
            SockOpt::RxQueueSize(_) => SockOptName::RxQueueSize,
            SockOpt::TxQueueSize(_) => SockOptName::TxQueueSize,
            SockOpt::KeepAlive(_) => SockOptName::KeepAlive,
            SockOpt::NoDelay(_) => SockOptName::NoDelay,
            SockOpt::MaxChildren(_) => SockOptName::MaxChildren,
            SockOpt::Secure(_) => SockOptName::Secure,
            SockOpt::Type(_) => SockOptName::Type,
            SockOpt::AcceptConn(_) => SockOptName::AcceptConn,
            SockOpt::Error(_) => SockOptName::Error,
        }
    }
}

fn check_type(sock: &Socket, name: SockOptName) -> Result<(), SockError> {
    if sock.ty == SocketType::None {
        return Err(SockError::InvalidType);
    }
    if name.stream_only() && sock.ty != SocketType::Stream {
        return Err(SockError::InvalidType);
    }
    Ok(())
}

fn check_q_size(size: usize) -> Result<usize, SockError> {
    if size == 0 || size > SOCK_Q_SIZE_MAX {
        return Err(SockError::InvalidArgument);
    }
    Ok(size)
}

impl SockCore {
    pub(crate) fn set_option(&mut self, id: SockId, opt: SockOpt) -> Result<(), SockError> {
        let has_secure = self.secure.is_some();
        let sock = self.pool.lookup_mut(id)?;
        check_type(sock, opt.name())?;
        let conn = sock.conn;
        let is_stream = sock.ty == SocketType::Stream;

        match opt {
            SockOpt::NonBlocking(on) => sock.flags.set(SockFlags::NON_BLOCKING, on),
            SockOpt::RxTimeout(t) => sock.rx_timeout = t,
            SockOpt::TxTimeout(t) => sock.tx_timeout = t,
            SockOpt::ConnReqTimeout(t) => sock.conn_req_timeout = t,
            SockOpt::AcceptTimeout(t) => sock.accept_timeout = t,
            SockOpt::CloseTimeout(t) => sock.close_timeout = t,
            SockOpt::RxQueueSize(size) => {
                sock.rx_q_max = check_q_size(size)?;
                if let (true, Some(conn)) = (is_stream, conn) {
                    self.tcp.set_rx_window(conn, size, &mut self.wire);
                }
            }
            SockOpt::TxQueueSize(size) => {
                sock.tx_q_max = check_q_size(size)?;
                if let (true, Some(conn)) = (is_stream, conn) {
                    self.tcp.set_tx_queue(conn, size);
                }
            }
            SockOpt::KeepAlive(on) => {
                sock.keep_alive = on;
                if let Some(conn) = conn {
                    self.tcp.set_keep_alive(conn, on);
                }
            }
            SockOpt::NoDelay(on) => {
                sock.no_delay = on;
                if let Some(conn) = conn {
                    self.tcp.set_no_delay(conn, on);
                }
            }
            SockOpt::MaxChildren(Some(0)) => return Err(SockError::InvalidArgument),
            SockOpt::MaxChildren(max) => sock.max_children = max,
            SockOpt::Secure(on) => {
                if on && !has_secure {
                    return Err(SockError::InvalidArgument);
                }
                if !matches!(sock.state, SockState::Closed | SockState::Bound) {
                    return Err(SockError::InvalidState);
                }
                sock.flags.set(SockFlags::SECURE, on);
            }
            SockOpt::Type(_) | SockOpt::AcceptConn(_) | SockOpt::Error(_) => {
                return Err(SockError::InvalidArgument)
            }
        }
        log::trace!("sock {}: set {:?}", id.0, opt);
        Ok(())
    }

    pub(crate) fn get_option(&mut self, id: SockId, name: SockOptName) -> Result<SockOpt, SockError> {
        let sock = self.pool.lookup_mut(id)?;
        check_type(sock, name)?;
        Ok(match name {
            SockOptName::NonBlocking => SockOpt::NonBlocking(sock.is_non_blocking()),
            SockOptName::RxTimeout => SockOpt::RxTimeout(sock.rx_timeout),
            SockOptName::TxTimeout => SockOpt::TxTimeout(sock.tx_timeout),
            SockOptName::ConnReqTimeout => SockOpt::ConnReqTimeout(sock.conn_req_timeout),
            SockOptName::AcceptTimeout => SockOpt::AcceptTimeout(sock.accept_timeout),
            SockOptName::CloseTimeout => SockOpt::CloseTimeout(sock.close_timeout),
            SockOptName::RxQueueSize => SockOpt::RxQueueSize(sock.rx_q_max),
            SockOptName::TxQueueSize => SockOpt::TxQueueSize(sock.tx_q_max),
            SockOptName::KeepAlive => SockOpt::KeepAlive(sock.keep_alive),
            SockOptName::NoDelay => SockOpt::NoDelay(sock.no_delay),
            SockOptName::MaxChildren => SockOpt::MaxChildren(sock.max_children),
            SockOptName::Secure => SockOpt::Secure(sock.flags.contains(SockFlags::SECURE)),
            SockOptName::Type => SockOpt::Type(sock.ty),
            SockOptName::AcceptConn => SockOpt::AcceptConn(sock.state == SockState::Listen),
            SockOptName::Error => SockOpt::Error(sock.fault.take()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{ProtocolFamily, SockAddr};
    use crate::config::SockConfig;
    use crate::stack::NetStack;

    fn stack() -> NetStack {
        NetStack::new(SockConfig::default()).unwrap()
    }

    #[test]
    fn test_defaults_follow_config() {
        let s = stack();
        let d = s.open(ProtocolFamily::Inet4, SocketType::Datagram, None).unwrap();
        let t = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        let cfg = SockConfig::default();
        assert_eq!(
            s.get_option(d, SockOptName::RxQueueSize),
            Ok(SockOpt::RxQueueSize(cfg.dgram_rx_q_size))
        );
        assert_eq!(
            s.get_option(t, SockOptName::TxQueueSize),
            Ok(SockOpt::TxQueueSize(cfg.stream_tx_q_size))
        );
        assert_eq!(
            s.get_option(t, SockOptName::CloseTimeout),
            Ok(SockOpt::CloseTimeout(cfg.close_timeout))
        );
        assert_eq!(s.get_option(d, SockOptName::Type), Ok(SockOpt::Type(SocketType::Datagram)));
    }

    #[test]
    fn test_set_then_get() {
        let s = stack();
        let t = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        s.set_option(t, SockOpt::NonBlocking(true)).unwrap();
        s.set_option(t, SockOpt::RxTimeout(Timeout::Ms(250))).unwrap();
        s.set_option(t, SockOpt::RxQueueSize(1024)).unwrap();
        s.set_option(t, SockOpt::MaxChildren(Some(3))).unwrap();
        assert_eq!(s.get_option(t, SockOptName::NonBlocking), Ok(SockOpt::NonBlocking(true)));
        assert_eq!(
            s.get_option(t, SockOptName::RxTimeout),
            Ok(SockOpt::RxTimeout(Timeout::Ms(250)))
        );
        assert_eq!(s.get_option(t, SockOptName::RxQueueSize), Ok(SockOpt::RxQueueSize(1024)));
        assert_eq!(
            s.get_option(t, SockOptName::MaxChildren),
            Ok(SockOpt::MaxChildren(Some(3)))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let s = stack();
        let d = s.open(ProtocolFamily::Inet4, SocketType::Datagram, None).unwrap();
        let t = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        assert_eq!(s.set_option(d, SockOpt::RxQueueSize(0)), Err(SockError::InvalidArgument));
        assert_eq!(
            s.set_option(d, SockOpt::TxQueueSize(SOCK_Q_SIZE_MAX + 1)),
            Err(SockError::InvalidArgument)
        );
        assert_eq!(s.set_option(d, SockOpt::KeepAlive(true)), Err(SockError::InvalidType));
        assert_eq!(s.set_option(t, SockOpt::MaxChildren(Some(0))), Err(SockError::InvalidArgument));
        assert_eq!(s.set_option(t, SockOpt::AcceptConn(true)), Err(SockError::InvalidArgument));
        // No secure layer installed.
        assert_eq!(s.set_option(t, SockOpt::Secure(true)), Err(SockError::InvalidArgument));
        assert_eq!(s.get_option(t, SockOptName::Secure), Ok(SockOpt::Secure(false)));
    }

    #[test]
    fn test_accept_conn_tracks_listen() {
        let s = stack();
        let t = s.open(ProtocolFamily::Inet4, SocketType::Stream, None).unwrap();
        s.bind(t, &SockAddr::localhost(6000)).unwrap();
        assert_eq!(s.get_option(t, SockOptName::AcceptConn), Ok(SockOpt::AcceptConn(false)));
        s.listen(t, None).unwrap();
        assert_eq!(s.get_option(t, SockOptName::AcceptConn), Ok(SockOpt::AcceptConn(true)));
    }

    #[test]
    fn test_levels() {
        assert_eq!(SockOptName::NoDelay.level(), OptLevel::Tcp);
        assert_eq!(SockOptName::RxTimeout.level(), OptLevel::Socket);
        assert_eq!(SockOpt::KeepAlive(true).name(), SockOptName::KeepAlive);
    }
}
