//! Modbus TCP: MBAP/PDU codec and the listener.

pub mod codec;
pub mod server;

pub use codec::{DeviceIdentity, ExceptionCode, MbapHeader, Request};
pub use server::{ModbusServer, ModbusServerConfig};
