//! Connection registry.
//!
//! Every bound socket owns one registry entry holding its local and remote
//! addresses. The transport engines key their per-connection state by the
//! same [`ConnId`], and inbound traffic is demultiplexed with [`ConnTable::search`].
//!
//! # Matching
//!
//! `search` prefers, in order:
//!
//! 1. an exact local + remote match (connected sockets, accepted children)
//! 2. a specific local address with no remote (bound or listening)
//! 3. a wildcard local address with no remote (bound to INADDR_ANY)

use alloc::vec::Vec;

use crate::addr::{Ipv4Addr, ProtocolFamily, SockAddr, SocketProtocol};
use crate::pool::SockId;

/// Registry entry handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u16);

/// Quality of a [`ConnTable::search`] hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Exact,
    LocalOnly,
    Wildcard,
}

/// Registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    /// No free registry entry
    TableFull,
    /// Another entry already owns the local address
    AddrInUse,
    /// No ephemeral port available
    NoPorts,
    /// Address already set and overwrite not requested
    AlreadySet,
    /// Entry not allocated
    InvalidId,
}

#[derive(Debug, Clone)]
struct Conn {
    family: ProtocolFamily,
    protocol: SocketProtocol,
    local: Option<SockAddr>,
    remote: Option<SockAddr>,
    app: Option<SockId>,
}

/// Fixed-capacity connection registry.
pub struct ConnTable {
    slots: Vec<Option<Conn>>,
    free: Vec<ConnId>,
    ephemeral: (u16, u16),
    next_ephemeral: u16,
}

impl ConnTable {
    pub fn new(capacity: usize, ephemeral: (u16, u16)) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        // Reverse order so the lowest id is handed out first.
        let free = (0..capacity as u16).rev().map(ConnId).collect();
        ConnTable {
            slots,
            free,
            ephemeral,
            next_ephemeral: ephemeral.0,
        }
    }

    /// Allocate an entry with no addresses.
    pub fn get(
        &mut self,
        family: ProtocolFamily,
        protocol: SocketProtocol,
    ) -> Result<ConnId, ConnError> {
        let id = self.free.pop().ok_or(ConnError::TableFull)?;
        self.slots[id.0 as usize] = Some(Conn {
            family,
            protocol,
            local: None,
            remote: None,
            app: None,
        });
        log::trace!("conn: get {:?} ({:?})", id, protocol);
        Ok(id)
    }

    /// Release an entry. Releasing a free entry is a no-op.
    pub fn close(&mut self, id: ConnId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            if slot.take().is_some() {
                self.free.push(id);
                log::trace!("conn: close {:?}", id);
            }
        }
    }

    pub fn is_used(&self, id: ConnId) -> bool {
        self.entry(id).is_ok()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn local_addr(&self, id: ConnId) -> Option<SockAddr> {
        self.entry(id).ok().and_then(|c| c.local)
    }

    pub fn remote_addr(&self, id: ConnId) -> Option<SockAddr> {
        self.entry(id).ok().and_then(|c| c.remote)
    }

    /// Owning socket, if any.
    pub fn app(&self, id: ConnId) -> Option<SockId> {
        self.entry(id).ok().and_then(|c| c.app)
    }

    pub fn set_app(&mut self, id: ConnId, app: Option<SockId>) -> Result<(), ConnError> {
        self.entry_mut(id)?.app = app;
        Ok(())
    }

    /// Set the local address.
    ///
    /// A zero port is replaced by an ephemeral port. While the entry has no
    /// remote address the local address must not collide with another
    /// unconnected entry of the same protocol (a wildcard address collides
    /// with every address on the same port).
    ///
    /// # Returns
    ///
    /// The address actually stored.
    pub fn set_local_addr(
        &mut self,
        id: ConnId,
        mut addr: SockAddr,
        overwrite: bool,
    ) -> Result<SockAddr, ConnError> {
        let (family, protocol, has_local, has_remote) = {
            let c = self.entry(id)?;
            (c.family, c.protocol, c.local.is_some(), c.remote.is_some())
        };
        if has_local && !overwrite {
            return Err(ConnError::AlreadySet);
        }
        if addr.port == 0 {
            addr.port = self.alloc_port(family, protocol, addr.ip)?;
        } else if !has_remote && self.collides(id, family, protocol, addr) {
            log::debug!("conn: {} already bound", addr);
            return Err(ConnError::AddrInUse);
        }
        self.entry_mut(id)?.local = Some(addr);
        Ok(addr)
    }

    pub fn set_remote_addr(
        &mut self,
        id: ConnId,
        addr: SockAddr,
        overwrite: bool,
    ) -> Result<(), ConnError> {
        let c = self.entry_mut(id)?;
        if c.remote.is_some() && !overwrite {
            return Err(ConnError::AlreadySet);
        }
        c.remote = Some(addr);
        Ok(())
    }

    /// Find the entry that should receive traffic addressed to `local`
    /// from `remote`.
    pub fn search(
        &self,
        family: ProtocolFamily,
        protocol: SocketProtocol,
        local: SockAddr,
        remote: Option<SockAddr>,
    ) -> Option<(ConnId, MatchKind)> {
        let mut best: Option<(ConnId, MatchKind)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(c) = slot else { continue };
            if c.family != family || c.protocol != protocol {
                continue;
            }
            let Some(l) = c.local else { continue };
            if l.port != local.port {
                continue;
            }
            let ip_exact = l.ip == local.ip;
            if !ip_exact && !l.ip.is_unspecified() {
                continue;
            }
            let kind = match (c.remote, remote) {
                (Some(r), Some(want)) if r == want => MatchKind::Exact,
                (Some(_), _) => continue,
                (None, _) if ip_exact => MatchKind::LocalOnly,
                (None, _) => MatchKind::Wildcard,
            };
            let id = ConnId(idx as u16);
            if kind == MatchKind::Exact {
                return Some((id, kind));
            }
            if best.map_or(true, |(_, k)| kind < k) {
                best = Some((id, kind));
            }
        }
        best
    }

    /// True when another entry exactly owns the `local` + `remote` tuple.
    pub fn tuple_in_use(
        &self,
        except: ConnId,
        protocol: SocketProtocol,
        local: SockAddr,
        remote: SockAddr,
    ) -> bool {
        self.slots.iter().enumerate().any(|(idx, slot)| {
            idx != except.0 as usize
                && slot.as_ref().is_some_and(|c| {
                    c.protocol == protocol && c.local == Some(local) && c.remote == Some(remote)
                })
        })
    }

    /// Allocate an ephemeral port not bound by any entry of `protocol`.
    ///
    /// Rolling start point with a full sweep fallback.
    pub fn alloc_port(
        &mut self,
        family: ProtocolFamily,
        protocol: SocketProtocol,
        ip: Ipv4Addr,
    ) -> Result<u16, ConnError> {
        let (lo, hi) = self.ephemeral;
        let range = (hi - lo) as u32 + 1;
        let start = (self.next_ephemeral.max(lo) - lo) as u32;
        for offset in 0..range {
            let candidate = lo + ((start + offset) % range) as u16;
            let taken = self.slots.iter().flatten().any(|c| {
                c.family == family
                    && c.protocol == protocol
                    && c.local.is_some_and(|l| {
                        l.port == candidate
                            && (l.ip == ip || l.ip.is_unspecified() || ip.is_unspecified())
                    })
            });
            if !taken {
                self.next_ephemeral = if candidate == hi { lo } else { candidate + 1 };
                return Ok(candidate);
            }
        }
        log::debug!("conn: ephemeral ports exhausted");
        Err(ConnError::NoPorts)
    }

    fn collides(
        &self,
        id: ConnId,
        family: ProtocolFamily,
        protocol: SocketProtocol,
        addr: SockAddr,
    ) -> bool {
        self.slots.iter().enumerate().any(|(idx, slot)| {
            idx != id.0 as usize
                && slot.as_ref().is_some_and(|c| {
                    c.family == family
                        && c.protocol == protocol
                        && c.remote.is_none()
                        && c.local.is_some_and(|l| {
                            l.port == addr.port
                                && (l.ip == addr.ip
                                    || l.ip.is_unspecified()
                                    || addr.ip.is_unspecified())
                        })
                })
        })
    }

    fn entry(&self, id: ConnId) -> Result<&Conn, ConnError> {
        self.slots
            .get(id.0 as usize)
            .and_then(|s| s.as_ref())
            .ok_or(ConnError::InvalidId)
    }

    fn entry_mut(&mut self, id: ConnId) -> Result<&mut Conn, ConnError> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(ConnError::InvalidId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INET: ProtocolFamily = ProtocolFamily::Inet4;
    const UDP: SocketProtocol = SocketProtocol::Udp;
    const TCP: SocketProtocol = SocketProtocol::Tcp;

    fn table() -> ConnTable {
        ConnTable::new(8, (50000, 50003))
    }

    #[test]
    fn test_get_close_reuse() {
        let mut t = ConnTable::new(2, (50000, 50010));
        let a = t.get(INET, UDP).unwrap();
        let b = t.get(INET, UDP).unwrap();
        assert_ne!(a, b);
        assert_eq!(t.get(INET, UDP), Err(ConnError::TableFull));
        t.close(a);
        t.close(a);
        assert!(!t.is_used(a));
        assert_eq!(t.in_use(), 1);
        assert_eq!(t.get(INET, UDP), Ok(a));
    }

    #[test]
    fn test_bind_conflict() {
        let mut t = table();
        let a = t.get(INET, UDP).unwrap();
        let b = t.get(INET, UDP).unwrap();
        let c = t.get(INET, TCP).unwrap();
        t.set_local_addr(a, SockAddr::localhost(7), false).unwrap();
        assert_eq!(
            t.set_local_addr(b, SockAddr::localhost(7), false),
            Err(ConnError::AddrInUse)
        );
        assert_eq!(
            t.set_local_addr(b, SockAddr::any(7), false),
            Err(ConnError::AddrInUse)
        );
        // Different protocol shares the port space independently.
        assert!(t.set_local_addr(c, SockAddr::localhost(7), false).is_ok());
        assert_eq!(
            t.set_local_addr(a, SockAddr::localhost(8), false),
            Err(ConnError::AlreadySet)
        );
    }

    #[test]
    fn test_search_priority() {
        let mut t = table();
        let wild = t.get(INET, TCP).unwrap();
        t.set_local_addr(wild, SockAddr::any(80), false).unwrap();

        let peer = SockAddr::new(Ipv4Addr::new(10, 0, 0, 9), 40000);
        let local = SockAddr::localhost(80);
        assert_eq!(
            t.search(INET, TCP, local, Some(peer)),
            Some((wild, MatchKind::Wildcard))
        );

        let child = t.get(INET, TCP).unwrap();
        t.set_remote_addr(child, peer, false).unwrap();
        t.set_local_addr(child, local, false).unwrap();
        assert_eq!(
            t.search(INET, TCP, local, Some(peer)),
            Some((child, MatchKind::Exact))
        );

        let other = SockAddr::new(Ipv4Addr::new(10, 0, 0, 10), 40000);
        assert_eq!(
            t.search(INET, TCP, local, Some(other)),
            Some((wild, MatchKind::Wildcard))
        );
        assert_eq!(t.search(INET, UDP, local, Some(other)), None);
    }

    #[test]
    fn test_ephemeral_ports_rotate_and_exhaust() {
        let mut t = table();
        let mut ports = Vec::new();
        for _ in 0..4 {
            let id = t.get(INET, UDP).unwrap();
            let bound = t.set_local_addr(id, SockAddr::any(0), false).unwrap();
            ports.push(bound.port);
        }
        ports.sort_unstable();
        assert_eq!(ports, [50000, 50001, 50002, 50003]);

        let id = t.get(INET, UDP).unwrap();
        assert_eq!(
            t.set_local_addr(id, SockAddr::any(0), false),
            Err(ConnError::NoPorts)
        );
    }
}
