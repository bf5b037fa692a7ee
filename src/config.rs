//! Socket layer configuration.

use crate::error::SockError;
use crate::wait::Timeout;

/// Capacity of a [`SockDescSet`](crate::select::SockDescSet) in descriptors.
pub const SOCK_DESC_MAX: usize = 256;

/// Largest UDP payload carried over IPv4 (65535 - 20 - 8).
pub const DGRAM_PAYLOAD_MAX: usize = 65_507;

/// Largest queue ceiling accepted by `set_option`.
pub const SOCK_Q_SIZE_MAX: usize = 1 << 20;

/// Ephemeral port range (IANA recommended: 49152-65535).
pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Static configuration of a socket layer instance.
///
/// Queue ceilings are in octets. Timeouts are the defaults every new socket
/// starts with; each can be overridden per socket through `set_option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockConfig {
    /// Number of socket records in the pool
    pub sock_count: usize,
    /// Number of connection registry entries (at least `sock_count`)
    pub conn_count: usize,
    /// Accept-queue capacity when `listen` names none
    pub accept_q_default: usize,
    /// Upper bound on any accept-queue capacity
    pub accept_q_max: usize,
    /// Datagram receive-queue ceiling
    pub dgram_rx_q_size: usize,
    /// Datagram transmit ceiling (largest single send)
    pub dgram_tx_q_size: usize,
    /// Largest datagram payload accepted for transmit
    pub dgram_payload_max: usize,
    /// Stream receive window
    pub stream_rx_q_size: usize,
    /// Stream transmit queue ceiling
    pub stream_tx_q_size: usize,
    pub rx_timeout: Timeout,
    pub tx_timeout: Timeout,
    pub conn_req_timeout: Timeout,
    pub accept_timeout: Timeout,
    pub close_timeout: Timeout,
    /// Descriptor limit for `select` (at most [`SOCK_DESC_MAX`])
    pub sel_desc_max: usize,
    /// Inclusive ephemeral port range used for auto-bind
    pub ephemeral_ports: (u16, u16),
}

impl Default for SockConfig {
    fn default() -> Self {
        SockConfig {
            sock_count: 16,
            conn_count: 32,
            accept_q_default: 4,
            accept_q_max: 16,
            dgram_rx_q_size: 8 * 1024,
            dgram_tx_q_size: 2 * 1024,
            dgram_payload_max: 1472,
            stream_rx_q_size: 4 * 1024,
            stream_tx_q_size: 4 * 1024,
            rx_timeout: Timeout::Infinite,
            tx_timeout: Timeout::Infinite,
            conn_req_timeout: Timeout::Ms(10_000),
            accept_timeout: Timeout::Infinite,
            close_timeout: Timeout::Ms(10_000),
            sel_desc_max: 16,
            ephemeral_ports: (EPHEMERAL_PORT_START, EPHEMERAL_PORT_END),
        }
    }
}

impl SockConfig {
    /// Check internal consistency.
    ///
    /// # Returns
    ///
    /// `Err(InvalidArgument)` naming no field; the offending field is logged.
    pub fn validate(&self) -> Result<(), SockError> {
        fn check(ok: bool, what: &str) -> Result<(), SockError> {
            if ok {
                Ok(())
            } else {
                log::warn!("sockcfg: invalid {}", what);
                Err(SockError::InvalidArgument)
            }
        }

        check(
            self.sock_count >= 1 && self.sock_count <= SOCK_DESC_MAX,
            "sock_count",
        )?;
        check(self.conn_count >= self.sock_count, "conn_count")?;
        check(
            self.conn_count <= u16::MAX as usize,
            "conn_count (exceeds id space)",
        )?;
        check(
            self.accept_q_default >= 1 && self.accept_q_default <= self.accept_q_max,
            "accept_q_default",
        )?;
        check(self.dgram_rx_q_size >= 1, "dgram_rx_q_size")?;
        check(self.dgram_tx_q_size >= 1, "dgram_tx_q_size")?;
        check(
            self.dgram_payload_max >= 1 && self.dgram_payload_max <= DGRAM_PAYLOAD_MAX,
            "dgram_payload_max",
        )?;
        check(
            self.stream_rx_q_size >= 1 && self.stream_rx_q_size <= SOCK_Q_SIZE_MAX,
            "stream_rx_q_size",
        )?;
        check(
            self.stream_tx_q_size >= 1 && self.stream_tx_q_size <= SOCK_Q_SIZE_MAX,
            "stream_tx_q_size",
        )?;
        check(
            self.sel_desc_max >= 1 && self.sel_desc_max <= SOCK_DESC_MAX,
            "sel_desc_max",
        )?;
        let (lo, hi) = self.ephemeral_ports;
        check(lo != 0 && lo <= hi, "ephemeral_ports")?;
        Ok(())
    }
}
