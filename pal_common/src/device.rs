//! Device identity: kinds, protocol tags, and the static device record.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of simulated field device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Programmable logic controller — runs a scan cycle, usually owns physics.
    Plc,
    /// Remote terminal unit — PLC-like, wide-area SCADA outstation.
    Rtu,
    /// Operator screen — polls a SCADA tag database.
    Hmi,
    /// Supervisory system — polls field devices, maintains a tag database.
    Scada,
    /// Records selected tags over time into a bounded buffer.
    Historian,
    /// Intelligent electronic device (protection relay class).
    Ied,
    /// Safety instrumented system — independent trip controller.
    Sis,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plc => "plc",
            Self::Rtu => "rtu",
            Self::Hmi => "hmi",
            Self::Scada => "scada",
            Self::Historian => "historian",
            Self::Ied => "ied",
            Self::Sis => "sis",
        };
        f.write_str(s)
    }
}

/// Industrial protocol spoken by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolTag {
    /// Modbus TCP (bit-exact on the core function codes).
    ModbusTcp,
    /// Siemens S7comm over COTP/TPKT.
    S7,
    /// DNP3 over TCP.
    Dnp3,
    /// IEC 60870-5-104.
    Iec104,
    /// OPC UA binary transport.
    OpcUa,
    /// EtherNet/IP encapsulation.
    EthernetIp,
}

impl ProtocolTag {
    /// IANA/industry default TCP port for this protocol.
    pub const fn default_port(self) -> u16 {
        match self {
            Self::ModbusTcp => crate::consts::MODBUS_TCP_PORT,
            Self::S7 => crate::consts::S7_PORT,
            Self::Dnp3 => crate::consts::DNP3_PORT,
            Self::Iec104 => crate::consts::IEC104_PORT,
            Self::OpcUa => crate::consts::OPCUA_PORT,
            Self::EthernetIp => crate::consts::ENIP_PORT,
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ModbusTcp => "modbus_tcp",
            Self::S7 => "s7",
            Self::Dnp3 => "dnp3",
            Self::Iec104 => "iec104",
            Self::OpcUa => "opc_ua",
            Self::EthernetIp => "ethernet_ip",
        };
        f.write_str(s)
    }
}

/// Static identity of a registered device.
///
/// Runtime state (online flag, memory map, last-update time) lives in the
/// state fabric; this struct never changes after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique device name (registry key).
    pub name: String,
    /// Device kind.
    pub kind: DeviceKind,
    /// Small integer id (Modbus unit id by convention).
    pub device_id: u8,
    /// Protocols this device exposes.
    pub protocols: Vec<ProtocolTag>,
    /// Free-form metadata (vendor, firmware, location).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DeviceInfo {
    /// Construct a device record with empty metadata.
    pub fn new(name: impl Into<String>, kind: DeviceKind, device_id: u8) -> Self {
        Self {
            name: name.into(),
            kind,
            device_id,
            protocols: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Add a protocol tag (builder style).
    #[must_use]
    pub fn with_protocol(mut self, tag: ProtocolTag) -> Self {
        if !self.protocols.contains(&tag) {
            self.protocols.push(tag);
        }
        self
    }

    /// Whether this device declares the given protocol.
    pub fn speaks(&self, tag: ProtocolTag) -> bool {
        self.protocols.contains(&tag)
    }
}
