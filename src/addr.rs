//! Addresses, families, socket types and protocols.
//!
//! Inside the crate ports are plain host-order integers. The raw
//! `sockaddr_in` image produced by [`SockAddr::to_raw`] follows the BSD
//! convention: family in host order, port and address in network order.

use core::fmt;
use core::str::FromStr;

use crate::error::SockError;

// ============================================================================
// IPv4 Address
// ============================================================================

/// IPv4 address (4 bytes, network order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// Create from 4 octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    /// All zeros (0.0.0.0)
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

    /// Loopback (127.0.0.1)
    pub const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    /// Broadcast (255.255.255.255)
    pub const BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255, 255, 255, 255]
    }

    #[inline]
    pub fn octets(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl FromStr for Ipv4Addr {
    type Err = SockError;

    /// Parse dotted-decimal notation. Exactly four decimal parts, each
    /// 0..=255, no leading zeros (octal ambiguity) and no empty parts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 4];
        let mut parts = s.split('.');
        for slot in out.iter_mut() {
            let part = parts.next().ok_or(SockError::InvalidArgument)?;
            if part.is_empty()
                || part.len() > 3
                || (part.len() > 1 && part.starts_with('0'))
                || !part.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(SockError::InvalidArgument);
            }
            let v: u16 = part.parse().map_err(|_| SockError::InvalidArgument)?;
            *slot = u8::try_from(v).map_err(|_| SockError::InvalidArgument)?;
        }
        if parts.next().is_some() {
            return Err(SockError::InvalidArgument);
        }
        Ok(Ipv4Addr(out))
    }
}

// ============================================================================
// Families, types, protocols
// ============================================================================

/// Protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// IPv4 Internet domain (AF_INET)
    Inet4,
}

impl ProtocolFamily {
    /// BSD AF_INET value
    pub const AF_INET: u16 = 2;

    /// Parse from the BSD domain constant
    pub fn from_raw(domain: u16) -> Result<Self, SockError> {
        match domain {
            Self::AF_INET => Ok(ProtocolFamily::Inet4),
            _ => Err(SockError::InvalidFamily),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            ProtocolFamily::Inet4 => Self::AF_INET,
        }
    }
}

/// Socket type. `None` only ever appears on a free record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SocketType {
    #[default]
    None,
    /// Datagram socket (SOCK_DGRAM)
    Datagram,
    /// Stream socket (SOCK_STREAM)
    Stream,
}

impl SocketType {
    /// BSD SOCK_STREAM value
    pub const SOCK_STREAM: u32 = 1;
    /// BSD SOCK_DGRAM value
    pub const SOCK_DGRAM: u32 = 2;

    /// Parse from the BSD type constant
    pub fn from_raw(ty: u32) -> Result<Self, SockError> {
        match ty {
            Self::SOCK_STREAM => Ok(SocketType::Stream),
            Self::SOCK_DGRAM => Ok(SocketType::Datagram),
            _ => Err(SockError::InvalidType),
        }
    }
}

/// Transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketProtocol {
    /// TCP (IPPROTO_TCP = 6)
    Tcp,
    /// UDP (IPPROTO_UDP = 17)
    Udp,
}

impl SocketProtocol {
    pub const IPPROTO_TCP: u32 = 6;
    pub const IPPROTO_UDP: u32 = 17;

    /// Resolve the protocol for `ty`, inferring it when `proto` is `None`.
    ///
    /// # Returns
    ///
    /// `InvalidType` for [`SocketType::None`], `InvalidProtocol` when the
    /// protocol does not match the type.
    pub fn resolve(proto: Option<SocketProtocol>, ty: SocketType) -> Result<Self, SockError> {
        match (ty, proto) {
            (SocketType::None, _) => Err(SockError::InvalidType),
            (SocketType::Stream, None | Some(SocketProtocol::Tcp)) => Ok(SocketProtocol::Tcp),
            (SocketType::Datagram, None | Some(SocketProtocol::Udp)) => Ok(SocketProtocol::Udp),
            _ => Err(SockError::InvalidProtocol),
        }
    }

    /// Parse from the BSD protocol constant; zero means "infer from type".
    pub fn from_raw(proto: u32) -> Result<Option<Self>, SockError> {
        match proto {
            0 => Ok(None),
            Self::IPPROTO_TCP => Ok(Some(SocketProtocol::Tcp)),
            Self::IPPROTO_UDP => Ok(Some(SocketProtocol::Udp)),
            _ => Err(SockError::InvalidProtocol),
        }
    }
}

// ============================================================================
// Socket Address
// ============================================================================

/// IPv4 socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SockAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl SockAddr {
    /// Size of the raw `sockaddr_in` image
    pub const RAW_LEN: usize = 16;

    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        SockAddr { ip, port }
    }

    /// Wildcard address with `port` (INADDR_ANY)
    pub const fn any(port: u16) -> Self {
        SockAddr::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Loopback address with `port`
    pub const fn localhost(port: u16) -> Self {
        SockAddr::new(Ipv4Addr::LOCALHOST, port)
    }

    /// True when usable as a destination (specified address and port).
    #[inline]
    pub fn is_routable(&self) -> bool {
        !self.ip.is_unspecified() && self.port != 0
    }

    /// Encode as `sockaddr_in`: family (host order), port (network order),
    /// address (network order), eight zero octets.
    pub fn to_raw(&self) -> [u8; Self::RAW_LEN] {
        let mut raw = [0u8; Self::RAW_LEN];
        raw[0..2].copy_from_slice(&ProtocolFamily::AF_INET.to_ne_bytes());
        raw[2..4].copy_from_slice(&self.port.to_be_bytes());
        raw[4..8].copy_from_slice(&self.ip.0);
        raw
    }

    /// Decode a `sockaddr_in` image.
    ///
    /// The family field is read in host order; callers must not byte-swap it.
    pub fn from_raw(raw: &[u8]) -> Result<Self, SockError> {
        if raw.len() < Self::RAW_LEN {
            return Err(SockError::InvalidArgument);
        }
        let family = u16::from_ne_bytes([raw[0], raw[1]]);
        ProtocolFamily::from_raw(family)?;
        let port = u16::from_be_bytes([raw[2], raw[3]]);
        let ip = Ipv4Addr([raw[4], raw[5], raw[6], raw[7]]);
        Ok(SockAddr { ip, port })
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
