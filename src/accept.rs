//! Accept queue of a listening stream socket.
//!
//! A single bounded queue holds both half-open connections (SYN received,
//! SYN-ACK sent, `ready == false`) and fully established ones waiting for
//! `accept()` (`ready == true`). Entries keep arrival order; `pop_ready`
//! returns the oldest ready entry, skipping half-open ones ahead of it.
//!
//! Bounding the queue as a whole caps the resources a burst of connection
//! requests can pin on one listener.

use alloc::collections::VecDeque;

use crate::conn::ConnId;
use crate::error::SockError;

/// One pending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptEntry {
    pub conn: ConnId,
    /// Handshake complete, ready for `accept()`
    pub ready: bool,
}

/// Passive-open bookkeeping for a listening stream socket.
#[derive(Debug, Clone)]
pub struct AcceptQueue {
    entries: VecDeque<AcceptEntry>,
    capacity: usize,
}

impl AcceptQueue {
    /// Create a queue of `min(requested, max)` entries, or `default` when
    /// nothing was requested.
    pub fn new(requested: Option<usize>, default: usize, max: usize) -> Self {
        let capacity = requested.map_or(default, |r| r.min(max)).max(1);
        AcceptQueue {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a half-open entry.
    ///
    /// # Returns
    ///
    /// `Err(WouldOverflow)` when the queue is at capacity.
    pub fn push(&mut self, conn: ConnId) -> Result<(), SockError> {
        if self.entries.len() >= self.capacity {
            return Err(SockError::WouldOverflow);
        }
        self.entries.push_back(AcceptEntry { conn, ready: false });
        Ok(())
    }

    /// Flag the entry for `conn` as ready. Returns false when absent.
    pub fn mark_ready(&mut self, conn: ConnId) -> bool {
        match self.entries.iter_mut().find(|e| e.conn == conn) {
            Some(e) => {
                e.ready = true;
                true
            }
            None => false,
        }
    }

    /// Remove and return the oldest ready entry.
    pub fn pop_ready(&mut self) -> Result<ConnId, SockError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.ready)
            .ok_or(SockError::NotFound)?;
        self.entries
            .remove(idx)
            .map(|e| e.conn)
            .ok_or(SockError::NotFound)
    }

    /// Remove the entry for `conn` whatever its readiness. Returns false
    /// when absent.
    pub fn remove(&mut self, conn: ConnId) -> bool {
        match self.entries.iter().position(|e| e.conn == conn) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Take every entry, leaving the queue empty.
    pub fn drain(&mut self) -> impl Iterator<Item = AcceptEntry> + '_ {
        self.entries.drain(..)
    }

    pub fn has_ready(&self) -> bool {
        self.entries.iter().any(|e| e.ready)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when one more connection request may be admitted: the queue has
    /// room and, when `max_children` is set, queued entries plus accepted
    /// children stay below it.
    pub fn is_avail(&self, children: usize, max_children: Option<usize>) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        match max_children {
            Some(max) => self.entries.len() + children < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_selection() {
        assert_eq!(AcceptQueue::new(None, 4, 16).capacity(), 4);
        assert_eq!(AcceptQueue::new(Some(8), 4, 16).capacity(), 8);
        assert_eq!(AcceptQueue::new(Some(100), 4, 16).capacity(), 16);
    }

    #[test]
    fn test_overflow() {
        let mut q = AcceptQueue::new(Some(3), 4, 16);
        for i in 0..3 {
            q.push(ConnId(i)).unwrap();
        }
        assert_eq!(q.push(ConnId(3)), Err(SockError::WouldOverflow));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_pop_ready_fifo_skips_half_open() {
        let mut q = AcceptQueue::new(Some(4), 4, 16);
        for i in 0..4 {
            q.push(ConnId(i)).unwrap();
        }
        assert_eq!(q.pop_ready(), Err(SockError::NotFound));
        assert!(q.mark_ready(ConnId(3)));
        assert!(q.mark_ready(ConnId(1)));
        assert!(!q.mark_ready(ConnId(9)));
        assert_eq!(q.pop_ready(), Ok(ConnId(1)));
        assert_eq!(q.pop_ready(), Ok(ConnId(3)));
        assert_eq!(q.pop_ready(), Err(SockError::NotFound));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut q = AcceptQueue::new(Some(2), 4, 16);
        q.push(ConnId(5)).unwrap();
        assert!(!q.remove(ConnId(6)));
        assert_eq!(q.len(), 1);
        assert!(q.remove(ConnId(5)));
        assert!(q.is_empty());
    }

    #[test]
    fn test_availability_counts_children() {
        let mut q = AcceptQueue::new(Some(4), 4, 16);
        q.push(ConnId(0)).unwrap();
        assert!(q.is_avail(0, None));
        assert!(q.is_avail(1, Some(3)));
        assert!(!q.is_avail(2, Some(3)));
        for i in 1..4 {
            q.push(ConnId(i)).unwrap();
        }
        assert!(!q.is_avail(0, None));
    }
}
