//! Modbus Application Protocol v1.1b3 — MBAP header and PDU codec.
//!
//! Bit-exact on function codes 1, 2, 3, 4, 5, 6, 15, 16 and 43/14 (read
//! device identification). Exception responses set the high bit of the
//! function code and carry a one-byte exception code.

use pal_common::consts::{
    MODBUS_MAX_PDU, MODBUS_MAX_READ_BITS, MODBUS_MAX_READ_REGS, MODBUS_MAX_WRITE_BITS,
    MODBUS_MAX_WRITE_REGS,
};
use pal_common::memory::{AddressKey, AddressSpace, Value};

use crate::mirror::{SharedMirror, WriteReject};

// ─── Wire structures ────────────────────────────────────────────────

/// MBAP header (7 bytes, big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Client transaction id, echoed in the response.
    pub transaction_id: u16,
    /// Bytes following the length field (unit id + PDU).
    pub length: u16,
    /// Addressed unit, echoed in the response.
    pub unit_id: u8,
}

/// A frame that cannot be a Modbus TCP frame at all — the session is
/// terminated rather than answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// `protocol_id` was not 0x0000.
    BadProtocolId(u16),
    /// Length field outside `2..=MODBUS_MAX_PDU + 1`.
    BadLength(u16),
}

impl MbapHeader {
    /// Parse the 7 header bytes.
    pub fn parse(buf: &[u8; 7]) -> Result<Self, FrameError> {
        let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
        let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u16::from_be_bytes([buf[4], buf[5]]);
        if protocol_id != 0 {
            return Err(FrameError::BadProtocolId(protocol_id));
        }
        if length < 2 || length as usize > MODBUS_MAX_PDU + 1 {
            return Err(FrameError::BadLength(length));
        }
        Ok(Self {
            transaction_id,
            length,
            unit_id: buf[6],
        })
    }

    /// Encode a response header for a PDU of `pdu_len` bytes.
    pub fn encode(transaction_id: u16, unit_id: u8, pdu_len: usize) -> [u8; 7] {
        let length = (pdu_len + 1) as u16;
        let tid = transaction_id.to_be_bytes();
        let len = length.to_be_bytes();
        [tid[0], tid[1], 0, 0, len[0], len[1], unit_id]
    }
}

/// Modbus exception codes used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Function code not supported.
    IllegalFunction = 0x01,
    /// Read or write touches an unmapped address.
    IllegalDataAddress = 0x02,
    /// Malformed payload or out-of-range count.
    IllegalDataValue = 0x03,
}

/// A validated request PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// FC 01.
    ReadCoils {
        /// Start address.
        addr: u16,
        /// Bit count, 1..=2000.
        count: u16,
    },
    /// FC 02.
    ReadDiscreteInputs {
        /// Start address.
        addr: u16,
        /// Bit count, 1..=2000.
        count: u16,
    },
    /// FC 03.
    ReadHoldingRegisters {
        /// Start address.
        addr: u16,
        /// Register count, 1..=125.
        count: u16,
    },
    /// FC 04.
    ReadInputRegisters {
        /// Start address.
        addr: u16,
        /// Register count, 1..=125.
        count: u16,
    },
    /// FC 05. `value` is the raw wire value (0x0000 or 0xFF00).
    WriteSingleCoil {
        /// Coil address.
        addr: u16,
        /// Raw output value.
        value: u16,
    },
    /// FC 06.
    WriteSingleRegister {
        /// Register address.
        addr: u16,
        /// Register value.
        value: u16,
    },
    /// FC 15.
    WriteMultipleCoils {
        /// Start address.
        addr: u16,
        /// Bit count, 1..=1968.
        count: u16,
        /// Packed output bits, LSB first.
        bits: Vec<u8>,
    },
    /// FC 16.
    WriteMultipleRegisters {
        /// Start address.
        addr: u16,
        /// Register values.
        values: Vec<u16>,
    },
    /// FC 43 / MEI 14.
    ReadDeviceIdentification {
        /// Read device id code (0x01..=0x04).
        read_code: u8,
        /// Starting object id.
        object_id: u8,
    },
}

/// Per-listener identity served by FC 43/14. Never shared between
/// listeners — every device keeps its own record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Object 0x00: vendor name.
    pub vendor: String,
    /// Object 0x01: product code.
    pub product: String,
    /// Object 0x02: major/minor revision.
    pub revision: String,
}

impl DeviceIdentity {
    /// Conventional identity for a device name.
    pub fn for_device(device: &str) -> Self {
        Self {
            vendor: "Tymyrddin Power & Light".to_string(),
            product: device.to_string(),
            revision: "1.0".to_string(),
        }
    }

    fn object(&self, id: u8) -> Option<&str> {
        match id {
            0x00 => Some(&self.vendor),
            0x01 => Some(&self.product),
            0x02 => Some(&self.revision),
            _ => None,
        }
    }
}

// ─── Request parsing ────────────────────────────────────────────────

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// Parse and validate a request PDU.
///
/// `Err((fc, code))` maps straight to an exception response. Count and
/// byte-count validation happens here (exception 03); address validation
/// happens against the mirror (exception 02).
pub fn parse_request(pdu: &[u8]) -> Result<Request, (u8, ExceptionCode)> {
    let Some(&fc) = pdu.first() else {
        return Err((0, ExceptionCode::IllegalDataValue));
    };
    let body = &pdu[1..];
    let malformed = (fc, ExceptionCode::IllegalDataValue);

    match fc {
        0x01 | 0x02 | 0x03 | 0x04 => {
            if body.len() != 4 {
                return Err(malformed);
            }
            let addr = be16(body, 0);
            let count = be16(body, 2);
            let max = if fc <= 0x02 {
                MODBUS_MAX_READ_BITS
            } else {
                MODBUS_MAX_READ_REGS
            };
            if count == 0 || count > max {
                return Err(malformed);
            }
            Ok(match fc {
                0x01 => Request::ReadCoils { addr, count },
                0x02 => Request::ReadDiscreteInputs { addr, count },
                0x03 => Request::ReadHoldingRegisters { addr, count },
                _ => Request::ReadInputRegisters { addr, count },
            })
        }
        0x05 => {
            if body.len() != 4 {
                return Err(malformed);
            }
            let addr = be16(body, 0);
            let value = be16(body, 2);
            if value != 0x0000 && value != 0xFF00 {
                return Err(malformed);
            }
            Ok(Request::WriteSingleCoil { addr, value })
        }
        0x06 => {
            if body.len() != 4 {
                return Err(malformed);
            }
            Ok(Request::WriteSingleRegister {
                addr: be16(body, 0),
                value: be16(body, 2),
            })
        }
        0x0F => {
            if body.len() < 5 {
                return Err(malformed);
            }
            let addr = be16(body, 0);
            let count = be16(body, 2);
            let byte_count = body[4] as usize;
            if count == 0 || count > MODBUS_MAX_WRITE_BITS {
                return Err(malformed);
            }
            if byte_count != count.div_ceil(8) as usize || body.len() != 5 + byte_count {
                return Err(malformed);
            }
            Ok(Request::WriteMultipleCoils {
                addr,
                count,
                bits: body[5..].to_vec(),
            })
        }
        0x10 => {
            if body.len() < 5 {
                return Err(malformed);
            }
            let addr = be16(body, 0);
            let count = be16(body, 2);
            let byte_count = body[4] as usize;
            if count == 0 || count > MODBUS_MAX_WRITE_REGS {
                return Err(malformed);
            }
            if byte_count != 2 * count as usize || body.len() != 5 + byte_count {
                return Err(malformed);
            }
            let values = (0..count as usize).map(|i| be16(body, 5 + 2 * i)).collect();
            Ok(Request::WriteMultipleRegisters { addr, values })
        }
        0x2B => {
            // MEI transport; only type 0x0E (device identification).
            if body.len() != 3 {
                return Err(malformed);
            }
            if body[0] != 0x0E {
                return Err((fc, ExceptionCode::IllegalFunction));
            }
            let read_code = body[1];
            if !(0x01..=0x04).contains(&read_code) {
                return Err(malformed);
            }
            Ok(Request::ReadDeviceIdentification {
                read_code,
                object_id: body[2],
            })
        }
        _ => Err((fc, ExceptionCode::IllegalFunction)),
    }
}

// ─── Response building ──────────────────────────────────────────────

/// Build the exception response for `fc`.
pub fn exception_pdu(fc: u8, code: ExceptionCode) -> Vec<u8> {
    vec![fc | 0x80, code as u8]
}

/// Pack bits LSB-first into bytes, per the read-bits response layout.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

/// Execute one request against the mirror and produce the response PDU.
///
/// Reads come from the visible snapshot; writes are validated and queued
/// for the next orchestrator sync. A write request is applied whole or not
/// at all.
pub fn handle_request(req: &Request, mirror: &SharedMirror, identity: &DeviceIdentity) -> Vec<u8> {
    match *req {
        Request::ReadCoils { addr, count } => {
            read_bits_response(0x01, mirror, AddressSpace::Coils, addr, count)
        }
        Request::ReadDiscreteInputs { addr, count } => {
            read_bits_response(0x02, mirror, AddressSpace::DiscreteInputs, addr, count)
        }
        Request::ReadHoldingRegisters { addr, count } => {
            read_words_response(0x03, mirror, AddressSpace::HoldingRegisters, addr, count)
        }
        Request::ReadInputRegisters { addr, count } => {
            read_words_response(0x04, mirror, AddressSpace::InputRegisters, addr, count)
        }
        Request::WriteSingleCoil { addr, value } => {
            let write = [(AddressKey::coil(addr), Value::Bit(value == 0xFF00))];
            match mirror.queue_writes(&write) {
                Ok(()) => {
                    let mut pdu = vec![0x05];
                    pdu.extend_from_slice(&addr.to_be_bytes());
                    pdu.extend_from_slice(&value.to_be_bytes());
                    pdu
                }
                Err(reject) => exception_pdu(0x05, reject_code(reject)),
            }
        }
        Request::WriteSingleRegister { addr, value } => {
            let write = [(AddressKey::holding(addr), Value::Word(value))];
            match mirror.queue_writes(&write) {
                Ok(()) => {
                    let mut pdu = vec![0x06];
                    pdu.extend_from_slice(&addr.to_be_bytes());
                    pdu.extend_from_slice(&value.to_be_bytes());
                    pdu
                }
                Err(reject) => exception_pdu(0x06, reject_code(reject)),
            }
        }
        Request::WriteMultipleCoils {
            addr,
            count,
            ref bits,
        } => {
            let values = unpack_bits(bits, count as usize);
            let Some(writes) = keyed_writes(addr, count, |i| {
                (AddressKey::coil(i), Value::Bit(values[(i - addr) as usize]))
            }) else {
                return exception_pdu(0x0F, ExceptionCode::IllegalDataAddress);
            };
            match mirror.queue_writes(&writes) {
                Ok(()) => {
                    let mut pdu = vec![0x0F];
                    pdu.extend_from_slice(&addr.to_be_bytes());
                    pdu.extend_from_slice(&count.to_be_bytes());
                    pdu
                }
                Err(reject) => exception_pdu(0x0F, reject_code(reject)),
            }
        }
        Request::WriteMultipleRegisters { addr, ref values } => {
            let count = values.len() as u16;
            let Some(writes) = keyed_writes(addr, count, |i| {
                (
                    AddressKey::holding(i),
                    Value::Word(values[(i - addr) as usize]),
                )
            }) else {
                return exception_pdu(0x10, ExceptionCode::IllegalDataAddress);
            };
            match mirror.queue_writes(&writes) {
                Ok(()) => {
                    let mut pdu = vec![0x10];
                    pdu.extend_from_slice(&addr.to_be_bytes());
                    pdu.extend_from_slice(&count.to_be_bytes());
                    pdu
                }
                Err(reject) => exception_pdu(0x10, reject_code(reject)),
            }
        }
        Request::ReadDeviceIdentification {
            read_code,
            object_id,
        } => identification_response(identity, read_code, object_id),
    }
}

fn reject_code(reject: WriteReject) -> ExceptionCode {
    match reject {
        WriteReject::Unmapped | WriteReject::NotWritable => ExceptionCode::IllegalDataAddress,
    }
}

/// Build `(key, value)` pairs for `addr..addr + count`, or `None` on
/// address-space overflow.
fn keyed_writes(
    addr: u16,
    count: u16,
    f: impl Fn(u16) -> (AddressKey, Value),
) -> Option<Vec<(AddressKey, Value)>> {
    let last = addr.checked_add(count - 1)?;
    Some((addr..=last).map(f).collect())
}

fn read_bits_response(
    fc: u8,
    mirror: &SharedMirror,
    space: AddressSpace,
    addr: u16,
    count: u16,
) -> Vec<u8> {
    match mirror.read_bits(space, addr, count) {
        Some(bits) => {
            let data = pack_bits(&bits);
            let mut pdu = Vec::with_capacity(2 + data.len());
            pdu.push(fc);
            pdu.push(data.len() as u8);
            pdu.extend_from_slice(&data);
            pdu
        }
        None => exception_pdu(fc, ExceptionCode::IllegalDataAddress),
    }
}

fn read_words_response(
    fc: u8,
    mirror: &SharedMirror,
    space: AddressSpace,
    addr: u16,
    count: u16,
) -> Vec<u8> {
    match mirror.read_words(space, addr, count) {
        Some(words) => {
            let mut pdu = Vec::with_capacity(2 + 2 * words.len());
            pdu.push(fc);
            pdu.push((2 * words.len()) as u8);
            for w in words {
                pdu.extend_from_slice(&w.to_be_bytes());
            }
            pdu
        }
        None => exception_pdu(fc, ExceptionCode::IllegalDataAddress),
    }
}

fn identification_response(identity: &DeviceIdentity, read_code: u8, object_id: u8) -> Vec<u8> {
    // Object list: basic category (0x00..=0x02). Individual access (0x04)
    // returns exactly one object.
    let objects: Vec<(u8, &str)> = if read_code == 0x04 {
        match identity.object(object_id) {
            Some(text) => vec![(object_id, text)],
            None => return exception_pdu(0x2B, ExceptionCode::IllegalDataAddress),
        }
    } else {
        vec![
            (0x00, identity.vendor.as_str()),
            (0x01, identity.product.as_str()),
            (0x02, identity.revision.as_str()),
        ]
    };

    let mut pdu = vec![
        0x2B, // fc
        0x0E, // MEI type
        read_code,
        0x01, // conformity: basic identification, stream access
        0x00, // more follows
        0x00, // next object id
        objects.len() as u8,
    ];
    for (id, text) in objects {
        let bytes = text.as_bytes();
        pdu.push(id);
        pdu.push(bytes.len().min(255) as u8);
        pdu.extend_from_slice(&bytes[..bytes.len().min(255)]);
    }
    pdu
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_common::memory::MemoryMap;
    use proptest::prelude::*;

    fn mirror() -> SharedMirror {
        let mut mem = MemoryMap::new();
        for i in 0..16 {
            mem.map_word(AddressKey::holding(i), 0x1100 + i);
            mem.map_word(AddressKey::input(i), 0x2200 + i);
            mem.map_bit(AddressKey::coil(i), i % 2 == 0);
            mem.map_bit(AddressKey::discrete(i), i % 3 == 0);
        }
        SharedMirror::new(mem.snapshot())
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::for_device("turbine_plc_1")
    }

    #[test]
    fn mbap_round_trip() {
        let hdr = MbapHeader::parse(&[0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x01]).unwrap();
        assert_eq!(hdr.transaction_id, 0x2A);
        assert_eq!(hdr.length, 6);
        assert_eq!(hdr.unit_id, 1);

        let out = MbapHeader::encode(0x2A, 1, 5);
        assert_eq!(out, [0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x01]);
    }

    #[test]
    fn mbap_rejects_bad_protocol_and_length() {
        assert_eq!(
            MbapHeader::parse(&[0, 1, 0, 7, 0, 6, 1]),
            Err(FrameError::BadProtocolId(7))
        );
        assert_eq!(
            MbapHeader::parse(&[0, 1, 0, 0, 0, 1, 1]),
            Err(FrameError::BadLength(1))
        );
        assert_eq!(
            MbapHeader::parse(&[0, 1, 0, 0, 0x01, 0x00, 1]),
            Err(FrameError::BadLength(256))
        );
    }

    #[test]
    fn fc03_reads_registers_big_endian() {
        let req = parse_request(&[0x03, 0x00, 0x02, 0x00, 0x02]).unwrap();
        assert_eq!(
            req,
            Request::ReadHoldingRegisters { addr: 2, count: 2 }
        );
        let pdu = handle_request(&req, &mirror(), &identity());
        assert_eq!(pdu, vec![0x03, 0x04, 0x11, 0x02, 0x11, 0x03]);
    }

    #[test]
    fn fc01_packs_bits_lsb_first() {
        // Coils 0..8 alternate true/false starting true.
        let req = parse_request(&[0x01, 0x00, 0x00, 0x00, 0x08]).unwrap();
        let pdu = handle_request(&req, &mirror(), &identity());
        assert_eq!(pdu, vec![0x01, 0x01, 0b0101_0101]);
    }

    #[test]
    fn fc04_single_register() {
        let req = parse_request(&[0x04, 0x00, 0x00, 0x00, 0x01]).unwrap();
        let pdu = handle_request(&req, &mirror(), &identity());
        assert_eq!(pdu, vec![0x04, 0x02, 0x22, 0x00]);
    }

    #[test]
    fn unmapped_read_is_exception_02() {
        // Device maps 0..16; address 9999 must answer exception 02, not
        // drop or close.
        let req = parse_request(&[0x03, 0x27, 0x0F, 0x00, 0x01]).unwrap();
        let pdu = handle_request(&req, &mirror(), &identity());
        assert_eq!(pdu, vec![0x83, 0x02]);
    }

    #[test]
    fn straddling_read_is_exception_02() {
        let req = parse_request(&[0x03, 0x00, 0x0A, 0x00, 0x0A]).unwrap();
        let pdu = handle_request(&req, &mirror(), &identity());
        assert_eq!(pdu, vec![0x83, 0x02]);
    }

    #[test]
    fn fc05_validates_output_value() {
        assert!(parse_request(&[0x05, 0x00, 0x00, 0xFF, 0x00]).is_ok());
        assert!(parse_request(&[0x05, 0x00, 0x00, 0x00, 0x00]).is_ok());
        assert_eq!(
            parse_request(&[0x05, 0x00, 0x00, 0x12, 0x34]),
            Err((0x05, ExceptionCode::IllegalDataValue))
        );
    }

    #[test]
    fn fc06_echoes_and_queues() {
        let m = mirror();
        let req = parse_request(&[0x06, 0x00, 0x05, 0x04, 0xD2]).unwrap();
        let pdu = handle_request(&req, &m, &identity());
        assert_eq!(pdu, vec![0x06, 0x00, 0x05, 0x04, 0xD2]);
        assert_eq!(
            m.take_pending(),
            vec![(AddressKey::holding(5), Value::Word(1234))]
        );
    }

    #[test]
    fn fc06_to_unmapped_register_is_exception_02() {
        let m = mirror();
        let req = parse_request(&[0x06, 0x00, 0x40, 0x00, 0x01]).unwrap();
        let pdu = handle_request(&req, &m, &identity());
        assert_eq!(pdu, vec![0x86, 0x02]);
        assert_eq!(m.pending_len(), 0);
    }

    #[test]
    fn fc15_byte_count_must_match() {
        // 10 coils → 2 data bytes.
        assert!(parse_request(&[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0xFF, 0x03]).is_ok());
        assert_eq!(
            parse_request(&[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0xFF]),
            Err((0x0F, ExceptionCode::IllegalDataValue))
        );
    }

    #[test]
    fn fc16_writes_whole_batch_or_nothing() {
        let m = mirror();
        // 0x000E..0x0011 straddles the mapped range: nothing is queued.
        let req = parse_request(&[
            0x10, 0x00, 0x0E, 0x00, 0x04, 0x08, 0, 1, 0, 2, 0, 3, 0, 4,
        ])
        .unwrap();
        let pdu = handle_request(&req, &m, &identity());
        assert_eq!(pdu, vec![0x90, 0x02]);
        assert_eq!(m.pending_len(), 0);

        let req = parse_request(&[0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0xBE, 0xEF, 0xCA, 0xFE])
            .unwrap();
        let pdu = handle_request(&req, &m, &identity());
        assert_eq!(pdu, vec![0x10, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(m.pending_len(), 2);
    }

    #[test]
    fn unknown_function_is_exception_01() {
        assert_eq!(
            parse_request(&[0x65, 0x00]),
            Err((0x65, ExceptionCode::IllegalFunction))
        );
    }

    #[test]
    fn device_identification_serves_basic_objects() {
        let req = parse_request(&[0x2B, 0x0E, 0x01, 0x00]).unwrap();
        let pdu = handle_request(&req, &mirror(), &identity());
        assert_eq!(&pdu[..7], &[0x2B, 0x0E, 0x01, 0x01, 0x00, 0x00, 0x03]);
        // First object: vendor name.
        assert_eq!(pdu[7], 0x00);
        let len = pdu[8] as usize;
        assert_eq!(&pdu[9..9 + len], b"Tymyrddin Power & Light");
    }

    #[test]
    fn device_identification_individual_object() {
        let req = parse_request(&[0x2B, 0x0E, 0x04, 0x01]).unwrap();
        let pdu = handle_request(&req, &mirror(), &identity());
        assert_eq!(pdu[6], 1); // one object
        assert_eq!(pdu[7], 0x01);
        let len = pdu[8] as usize;
        assert_eq!(&pdu[9..9 + len], b"turbine_plc_1");

        let req = parse_request(&[0x2B, 0x0E, 0x04, 0x7F]).unwrap();
        let pdu = handle_request(&req, &mirror(), &identity());
        assert_eq!(pdu, vec![0xAB, 0x02]);
    }

    proptest! {
        /// Arbitrary PDUs never panic the parser; they parse or they map
        /// to a well-formed exception.
        #[test]
        fn parser_is_total(pdu in proptest::collection::vec(any::<u8>(), 0..64)) {
            match parse_request(&pdu) {
                Ok(req) => {
                    let resp = handle_request(&req, &mirror(), &identity());
                    prop_assert!(!resp.is_empty());
                }
                Err((_fc, code)) => {
                    prop_assert!(matches!(
                        code,
                        ExceptionCode::IllegalFunction
                            | ExceptionCode::IllegalDataAddress
                            | ExceptionCode::IllegalDataValue
                    ));
                }
            }
        }
    }
}
