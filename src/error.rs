//! Socket layer error taxonomy.

use core::fmt;

use crate::conn::ConnError;
use crate::tcp::TcpError;
use crate::udp::UdpError;

/// Errors returned by socket operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockError {
    /// Handle out of range or not allocated
    InvalidHandle,
    /// Operation not supported by the socket type
    InvalidType,
    /// Operation not legal in the socket's current state
    InvalidState,
    /// Malformed argument (address, length, flags, option value)
    InvalidArgument,
    /// Address family other than IPv4
    InvalidFamily,
    /// Protocol does not match the socket type
    InvalidProtocol,
    /// Socket pool exhausted
    PoolEmpty,
    /// Connection registry or port space exhausted
    ResourceExhausted,
    /// Local address already bound
    AddrInUse,
    /// Operation would block on a non-blocking socket or call
    WouldBlock,
    /// Connection request still in progress
    InProgress,
    /// Blocking wait expired
    Timeout,
    /// Data or queue larger than the configured ceiling
    WouldOverflow,
    /// Connection failed after being established (reset, aborted)
    ConnFault,
    /// Connection request refused by the peer
    ConnRefused,
    /// Nothing to return (no ready accept entry, no such entry)
    NotFound,
    /// Wait aborted, typically because the socket was closed underneath
    Aborted,
}

impl fmt::Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SockError::InvalidHandle => "invalid socket handle",
            SockError::InvalidType => "operation not supported by socket type",
            SockError::InvalidState => "invalid socket state",
            SockError::InvalidArgument => "invalid argument",
            SockError::InvalidFamily => "address family not supported",
            SockError::InvalidProtocol => "protocol not supported",
            SockError::PoolEmpty => "no free sockets",
            SockError::ResourceExhausted => "connection resources exhausted",
            SockError::AddrInUse => "address already in use",
            SockError::WouldBlock => "operation would block",
            SockError::InProgress => "connection in progress",
            SockError::Timeout => "operation timed out",
            SockError::WouldOverflow => "data exceeds queue limit",
            SockError::ConnFault => "connection fault",
            SockError::ConnRefused => "connection refused",
            SockError::NotFound => "not found",
            SockError::Aborted => "wait aborted",
        };
        f.write_str(msg)
    }
}

impl From<ConnError> for SockError {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::TableFull | ConnError::NoPorts => SockError::ResourceExhausted,
            ConnError::AddrInUse => SockError::AddrInUse,
            ConnError::AlreadySet => SockError::InvalidState,
            ConnError::InvalidId => SockError::InvalidArgument,
        }
    }
}

impl From<TcpError> for SockError {
    fn from(e: TcpError) -> Self {
        match e {
            TcpError::NoTcb => SockError::ConnFault,
            TcpError::InvalidState => SockError::InvalidState,
            TcpError::Closing => SockError::InvalidState,
        }
    }
}

impl From<UdpError> for SockError {
    fn from(e: UdpError) -> Self {
        match e {
            UdpError::PayloadTooLarge => SockError::WouldOverflow,
            UdpError::InvalidDest => SockError::InvalidArgument,
        }
    }
}
