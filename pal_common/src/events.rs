//! Observable kernel events and the broadcast bus.
//!
//! Events are telemetry for tests and monitoring collaborators; the kernel
//! never blocks on them and never treats a missing subscriber as an error.

use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::debug;

use crate::device::ProtocolTag;

/// Kernel-observable event.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// A device was added to the state fabric.
    DeviceRegistered {
        /// Device name.
        name: String,
    },
    /// A device exceeded its consecutive scan-failure threshold and was
    /// taken offline.
    DeviceFaulted {
        /// Device name.
        name: String,
        /// Consecutive failures at the time of the fault.
        failures: u32,
    },
    /// The gate admitted a connection.
    ConnectionAllowed {
        /// Peer socket address.
        peer: SocketAddr,
        /// Destination device.
        device: String,
        /// Protocol served on the listener.
        protocol: ProtocolTag,
        /// Listener port.
        port: u16,
        /// Source network inferred from the peer address.
        src_network: String,
    },
    /// The gate refused a connection.
    ConnectionDenied {
        /// Peer socket address.
        peer: SocketAddr,
        /// Destination device.
        device: String,
        /// Protocol served on the listener.
        protocol: ProtocolTag,
        /// Listener port.
        port: u16,
        /// Source network inferred from the peer address.
        src_network: String,
    },
    /// Grid frequency crossed a protection limit (latched, at most once
    /// until the integrator is reset).
    GridTrip {
        /// Grid device name.
        device: String,
        /// Frequency at the moment of the trip [Hz].
        frequency_hz: f64,
    },
    /// A safety controller asserted an overspeed trip on a peer.
    OverspeedTrip {
        /// Safety device that tripped.
        device: String,
        /// Peer whose trip coil was asserted.
        target: String,
        /// Observed speed [rpm].
        speed_rpm: f64,
    },
    /// Reactor protection drove an emergency shutdown.
    ReactorScram {
        /// Reactor device name.
        device: String,
        /// Core temperature at SCRAM [°C].
        core_temp_c: f64,
    },
    /// Reactor containment failed. Terminal for the reactor.
    ContainmentBreach {
        /// Reactor device name.
        device: String,
    },
}

/// Broadcast bus for kernel events.
///
/// Cloning shares the underlying channel; `emit` never blocks and never
/// fails — with no subscribers the event is simply dropped (after logging).
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KernelEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all subscribers.
    pub fn emit(&self, event: KernelEvent) {
        debug!(?event, "kernel event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::consts::EVENT_BUS_CAPACITY)
    }
}
