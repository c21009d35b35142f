//! Wire constants, default ports, and kernel limits.

use static_assertions::const_assert;

// ─── Default TCP ports ──────────────────────────────────────────────

/// Modbus TCP (often remapped to 10502+ in unprivileged environments).
pub const MODBUS_TCP_PORT: u16 = 502;
/// Siemens S7comm (ISO-on-TCP).
pub const S7_PORT: u16 = 102;
/// DNP3 primary port (20000–20002 by convention).
pub const DNP3_PORT: u16 = 20000;
/// IEC 60870-5-104.
pub const IEC104_PORT: u16 = 2404;
/// OPC UA binary.
pub const OPCUA_PORT: u16 = 4840;
/// EtherNet/IP encapsulation.
pub const ENIP_PORT: u16 = 44818;

// ─── Modbus wire limits (Application Protocol v1.1b3) ───────────────

/// MBAP header length [bytes].
pub const MBAP_HEADER_LEN: usize = 7;
/// Maximum PDU length [bytes] (ADU 260 − MBAP 7).
pub const MODBUS_MAX_PDU: usize = 253;
/// FC 01/02: maximum bits per read.
pub const MODBUS_MAX_READ_BITS: u16 = 2000;
/// FC 03/04: maximum registers per read.
pub const MODBUS_MAX_READ_REGS: u16 = 125;
/// FC 15: maximum coils per write.
pub const MODBUS_MAX_WRITE_BITS: u16 = 1968;
/// FC 16: maximum registers per write.
pub const MODBUS_MAX_WRITE_REGS: u16 = 123;

// A full-size register read response (fc + byte count + data) must fit the PDU.
const_assert!(2 + 2 * MODBUS_MAX_READ_REGS as usize <= MODBUS_MAX_PDU);
// So must a full-size bit read response.
const_assert!(2 + (MODBUS_MAX_READ_BITS as usize + 7) / 8 <= MODBUS_MAX_PDU);

// ─── Kernel defaults ────────────────────────────────────────────────

/// Clock pacing interval in RealTime/Accelerated modes [ms wall].
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 10;
/// Consecutive scan failures before a device faults offline.
pub const DEFAULT_SCAN_FAULT_THRESHOLD: u32 = 5;
/// Default device scan interval [ms sim].
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 100;
/// Session drain window at shutdown [ms wall].
pub const SESSION_DRAIN_MS: u64 = 500;
/// Modbus idle session timeout [s wall].
pub const MODBUS_IDLE_TIMEOUT_S: u64 = 30;
/// Per-listener concurrent session cap.
pub const MAX_SESSIONS_PER_LISTENER: usize = 32;
/// Event bus channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;
/// Bound on the gate's denied-connection audit log.
pub const DENIED_LOG_CAPACITY: usize = 256;
/// Historian ring-buffer depth [samples].
pub const HISTORIAN_DEPTH: usize = 1024;
