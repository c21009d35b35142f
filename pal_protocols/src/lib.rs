//! # Protocol Servers
//!
//! Real TCP listeners exposing device memory maps. Each listener owns a
//! [`mirror::SharedMirror`] — a snapshot of its device's four address
//! spaces plus a pending-write buffer. Sessions are served entirely from
//! the mirror; the orchestrator synchronises mirror and device once per
//! tick (`mirror_pull` first, then `mirror_push`), which is what gives
//! client writes their one-tick causal latency.
//!
//! Modbus TCP is bit-exact on the core function codes; the secondary
//! protocols (S7, DNP3, IEC-104, OPC UA, EtherNet/IP) cover session
//! registration and their transport handshakes on the same contract.

#![warn(clippy::all)]

pub mod minimal;
pub mod mirror;
pub mod modbus;

use async_trait::async_trait;
use thiserror::Error;

use pal_common::device::ProtocolTag;
use pal_common::memory::{MapDelta, MemoryMapSnapshot};

pub use mirror::SharedMirror;

/// Listener-level error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Could not acquire the configured port. The orchestrator logs this
    /// and proceeds with the remaining listeners.
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        /// Requested bind address.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Listener already started or not yet started.
    #[error("listener lifecycle: {0}")]
    Lifecycle(&'static str),

    /// Session-level I/O error.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// The server contract every listener implements.
///
/// # Lifecycle
///
/// 1. `start()` — bind and begin accepting; returns once listening.
/// 2. Orchestrator, per tick: `mirror_pull()` then `mirror_push(snapshot)`.
/// 3. `stop()` — refuse new connections, drain sessions, close.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Device this listener serves.
    fn device(&self) -> &str;

    /// Protocol spoken.
    fn protocol(&self) -> ProtocolTag;

    /// Bound port (meaningful after `start`; configured port before).
    fn port(&self) -> u16;

    /// The listener's mirror handle.
    fn mirror(&self) -> SharedMirror;

    /// Bind and begin accepting connections.
    async fn start(&mut self) -> ProtocolResult<()>;

    /// Stop accepting, drain sessions within the drain window, close.
    async fn stop(&mut self);

    /// Republish the device's memory map to the mirror (orchestrator sync,
    /// after the pull). Pending client writes are unaffected.
    fn mirror_push(&self, snapshot: MemoryMapSnapshot) {
        self.mirror().push(snapshot);
    }

    /// Drain client writes received since the last pull.
    fn mirror_pull(&self) -> MapDelta {
        self.mirror().take_pending()
    }
}
