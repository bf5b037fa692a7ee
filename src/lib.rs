//! BSD-style socket layer for an embedded TCP/IP stack.
//!
//! This crate provides:
//! - A fixed-capacity socket pool with a per-socket lifecycle state machine
//! - Datagram (atomic) and stream (continuous) data paths
//! - Bounded accept queues for listening stream sockets
//! - `select` over socket descriptor sets
//! - Blocking calls with per-signal timeouts on pluggable scheduler hooks
//!
//! # Design
//!
//! All socket state lives in one context behind a single global lock.
//! Calls never block while holding it: a call that must wait releases the
//! lock, pends on the socket's signal, and retries once woken. Transport is
//! a lossless in-memory loopback wire carrying datagrams and stream
//! segments between sockets of the same [`NetStack`].
//!
//! # Example
//!
//! ```ignore
//! register_std_wait_hooks();
//! let stack = NetStack::new(SockConfig::default())?;
//! let server = stack.open(ProtocolFamily::Inet4, SocketType::Stream, None)?;
//! stack.bind(server, &SockAddr::localhost(80))?;
//! stack.listen(server, None)?;
//!
//! let client = stack.open(ProtocolFamily::Inet4, SocketType::Stream, None)?;
//! stack.connect(client, &SockAddr::localhost(80))?;
//! let (conn, _peer) = stack.accept(server)?;
//! stack.send(client, b"hello", MsgFlags::empty())?;
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod accept;
pub mod addr;
pub mod config;
pub mod conn;
mod dgram;
pub mod error;
pub mod options;
mod pool;
pub mod select;
mod stack;
mod stream;
pub mod tcp;
pub mod udp;
pub mod wait;
pub mod wire;

pub use addr::{Ipv4Addr, ProtocolFamily, SockAddr, SocketProtocol, SocketType};
pub use config::SockConfig;
pub use error::SockError;
pub use options::{OptLevel, SockOpt, SockOptName};
pub use pool::{PoolStats, SockFlags, SockId, SockState};
pub use select::{SelMask, SockDescSet};
pub use stack::{MsgFlags, NetStack, Recv, SecureHooks, Sent, StackStats};
pub use udp::UdpStats;
pub use wait::{register_wait_hooks, Timeout, WaitHooks, WaitOutcome, WaitQueue};

#[cfg(feature = "std")]
pub use wait::{register_std_wait_hooks, StdWaitHooks};
