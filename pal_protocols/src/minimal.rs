//! Minimal secondary-protocol servers.
//!
//! S7comm, DNP3, IEC-104, OPC UA, and EtherNet/IP listeners share one
//! generic acceptor/session shell and differ only in their transport
//! handshake responder. Coverage is deliberately shallow: session
//! registration (gate admission, events) plus the handshake each
//! protocol's scanners expect. Anything deeper terminates the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use pal_common::consts::{MAX_SESSIONS_PER_LISTENER, SESSION_DRAIN_MS};
use pal_common::device::ProtocolTag;
use pal_fabric::ClockHandle;
use pal_net::{Admission, ReachabilityGate};

use crate::mirror::SharedMirror;
use crate::{ProtocolError, ProtocolResult, ProtocolServer};

/// Idle timeout for secondary-protocol sessions.
const SECONDARY_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Generic minimal listener; the protocol tag selects the responder.
pub struct MinimalServer {
    device: String,
    tag: ProtocolTag,
    host: String,
    port: u16,
    mirror: SharedMirror,
    gate: Arc<ReachabilityGate>,
    clock: ClockHandle,
    bound_port: u16,
    sessions: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl MinimalServer {
    /// Create a stopped listener for `tag` on `host:port`.
    pub fn new(
        device: impl Into<String>,
        tag: ProtocolTag,
        host: impl Into<String>,
        port: u16,
        mirror: SharedMirror,
        gate: Arc<ReachabilityGate>,
        clock: ClockHandle,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            device: device.into(),
            tag,
            host: host.into(),
            port,
            mirror,
            gate,
            clock,
            bound_port: 0,
            sessions: Arc::new(AtomicUsize::new(0)),
            shutdown,
            accept_task: None,
        }
    }
}

#[async_trait]
impl ProtocolServer for MinimalServer {
    fn device(&self) -> &str {
        &self.device
    }

    fn protocol(&self) -> ProtocolTag {
        self.tag
    }

    fn port(&self) -> u16 {
        if self.bound_port != 0 {
            self.bound_port
        } else {
            self.port
        }
    }

    fn mirror(&self) -> SharedMirror {
        self.mirror.clone()
    }

    async fn start(&mut self) -> ProtocolResult<()> {
        if self.accept_task.is_some() {
            return Err(ProtocolError::Lifecycle("already started"));
        }
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProtocolError::BindFailed { addr, source })?;
        self.bound_port = listener.local_addr()?.port();
        info!(device = %self.device, protocol = %self.tag, port = self.bound_port, "listener up");

        let device = self.device.clone();
        let tag = self.tag;
        let port = self.bound_port;
        let gate = self.gate.clone();
        let clock = self.clock.clone();
        let sessions = self.sessions.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(device = %device, error = %e, "accept failed");
                        continue;
                    }
                };
                let admission = gate.admit(peer, &device, tag, port, clock.now());
                if matches!(admission, Admission::Denied { .. }) {
                    drop(stream);
                    continue;
                }
                if sessions.load(Ordering::Relaxed) >= MAX_SESSIONS_PER_LISTENER {
                    warn!(device = %device, %peer, "session cap reached, refusing");
                    drop(stream);
                    continue;
                }
                sessions.fetch_add(1, Ordering::Relaxed);
                let device = device.clone();
                let sessions = sessions.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_session(stream, &device, tag, shutdown).await;
                    sessions.fetch_sub(1, Ordering::Relaxed);
                });
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        let _ = timeout(Duration::from_millis(SESSION_DRAIN_MS), async {
            while self.sessions.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        info!(device = %self.device, protocol = %self.tag, "listener stopped");
    }
}

async fn run_session(
    mut stream: TcpStream,
    device: &str,
    tag: ProtocolTag,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 512];
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = timeout(SECONDARY_IDLE_TIMEOUT, stream.read(&mut buf)) => read,
        };
        let n = match read {
            Ok(Ok(n)) if n > 0 => n,
            _ => break,
        };
        match respond(tag, &buf[..n]) {
            Some(reply) => {
                if stream.write_all(&reply).await.is_err() {
                    break;
                }
            }
            None => {
                // Unsupported depth: terminate, per the protocol-error policy.
                debug!(device, %tag, "unsupported frame, closing session");
                break;
            }
        }
    }
}

/// Handshake responder. `None` closes the session.
pub fn respond(tag: ProtocolTag, frame: &[u8]) -> Option<Vec<u8>> {
    match tag {
        ProtocolTag::S7 => respond_s7(frame),
        ProtocolTag::Dnp3 => respond_dnp3(frame),
        ProtocolTag::Iec104 => respond_iec104(frame),
        ProtocolTag::OpcUa => respond_opcua(frame),
        ProtocolTag::EthernetIp => respond_enip(frame),
        ProtocolTag::ModbusTcp => None, // served by the real Modbus listener
    }
}

/// TPKT + COTP: answer a connection request (CR, 0xE0) with a connection
/// confirm (CC, 0xD0). Data TPDUs (S7comm proper) are out of scope.
fn respond_s7(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 7 || frame[0] != 0x03 || frame[1] != 0x00 {
        return None;
    }
    let pdu_type = frame[5];
    if pdu_type != 0xE0 {
        return None;
    }
    // CR carries the caller's source reference at offset 8..10 when present.
    let peer_ref = if frame.len() >= 10 {
        [frame[8], frame[9]]
    } else {
        [0x00, 0x00]
    };
    let cotp = [
        0x11, // length indicator: 17 bytes follow
        0xD0, // CC
        peer_ref[0],
        peer_ref[1], // dst-ref = caller's src-ref
        0x00,
        0x01, // our src-ref
        0x00, // class 0
        0xC0,
        0x01,
        0x0A, // TPDU size 1024
        0xC1,
        0x02,
        0x01,
        0x00, // src-tsap
        0xC2,
        0x02,
        0x01,
        0x02, // dst-tsap
    ];
    let total = (4 + cotp.len()) as u16;
    let mut out = vec![0x03, 0x00];
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&cotp);
    Some(out)
}

/// DNP3 link layer: answer REQUEST_LINK_STATUS (function 0x9) with
/// LINK_STATUS (0x0B), source/destination swapped.
fn respond_dnp3(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 10 || frame[0] != 0x05 || frame[1] != 0x64 {
        return None;
    }
    let ctrl = frame[3];
    if ctrl & 0x0F != 0x09 {
        return None;
    }
    let dst = [frame[4], frame[5]];
    let src = [frame[6], frame[7]];
    // Response header: len 5 (ctrl + addresses), DIR=0, PRM=0, LINK_STATUS.
    let mut header = vec![0x05, 0x64, 0x05, 0x0B, src[0], src[1], dst[0], dst[1]];
    let crc = crc_dnp(&header);
    header.extend_from_slice(&crc.to_le_bytes());
    Some(header)
}

/// CRC-16/DNP over a block (reflected, poly 0x3D65, final complement).
fn crc_dnp(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA6BC;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// IEC-104 U-frames: STARTDT/STOPDT/TESTFR activations get their
/// confirmations. I/S-frames (ASDU traffic) are out of scope.
fn respond_iec104(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 6 || frame[0] != 0x68 {
        return None;
    }
    let confirm = match frame[2] {
        0x07 => 0x0B, // STARTDT act → con
        0x13 => 0x23, // STOPDT act → con
        0x43 => 0x83, // TESTFR act → con
        _ => return None,
    };
    Some(vec![0x68, 0x04, confirm, 0x00, 0x00, 0x00])
}

/// OPC UA transport: answer Hello with Acknowledge. Secure-channel
/// negotiation is out of scope.
fn respond_opcua(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 8 || &frame[0..3] != b"HEL" {
        return None;
    }
    let mut out = Vec::with_capacity(28);
    out.extend_from_slice(b"ACK");
    out.push(b'F');
    out.extend_from_slice(&28u32.to_le_bytes()); // message size
    out.extend_from_slice(&0u32.to_le_bytes()); // protocol version
    out.extend_from_slice(&65536u32.to_le_bytes()); // receive buffer
    out.extend_from_slice(&65536u32.to_le_bytes()); // send buffer
    out.extend_from_slice(&0u32.to_le_bytes()); // max message size (none)
    out.extend_from_slice(&0u32.to_le_bytes()); // max chunk count (none)
    Some(out)
}

/// EtherNet/IP encapsulation: RegisterSession and ListIdentity.
fn respond_enip(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 24 {
        return None;
    }
    let command = u16::from_le_bytes([frame[0], frame[1]]);
    let sender_context = &frame[12..20];
    match command {
        0x0065 => {
            // RegisterSession: grant handle 1, echo context.
            let mut out = Vec::with_capacity(28);
            out.extend_from_slice(&0x0065u16.to_le_bytes());
            out.extend_from_slice(&4u16.to_le_bytes()); // data length
            out.extend_from_slice(&1u32.to_le_bytes()); // session handle
            out.extend_from_slice(&0u32.to_le_bytes()); // status: success
            out.extend_from_slice(sender_context);
            out.extend_from_slice(&0u32.to_le_bytes()); // options
            out.extend_from_slice(&1u16.to_le_bytes()); // protocol version
            out.extend_from_slice(&0u16.to_le_bytes()); // options flags
            Some(out)
        }
        0x0063 => {
            // ListIdentity: empty item list (identity disclosure happens on
            // the Modbus FC 43 surface; this just keeps scanners engaged).
            let mut out = Vec::with_capacity(26);
            out.extend_from_slice(&0x0063u16.to_le_bytes());
            out.extend_from_slice(&2u16.to_le_bytes()); // data length
            out.extend_from_slice(&0u32.to_le_bytes()); // session
            out.extend_from_slice(&0u32.to_le_bytes()); // status
            out.extend_from_slice(sender_context);
            out.extend_from_slice(&0u32.to_le_bytes()); // options
            out.extend_from_slice(&0u16.to_le_bytes()); // item count 0
            Some(out)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s7_connection_request_gets_confirm() {
        // TPKT + COTP CR with src-ref 0x1234.
        let cr = [
            0x03, 0x00, 0x00, 0x16, 0x11, 0xE0, 0x00, 0x00, 0x12, 0x34, 0x00, 0xC0, 0x01, 0x0A,
            0xC1, 0x02, 0x01, 0x00, 0xC2, 0x02, 0x01, 0x02,
        ];
        let cc = respond(ProtocolTag::S7, &cr).unwrap();
        assert_eq!(&cc[..2], &[0x03, 0x00]);
        assert_eq!(cc[5], 0xD0); // CC
        assert_eq!(&cc[6..8], &[0x12, 0x34]); // dst-ref echoes our src-ref
        assert_eq!(cc.len(), 22);

        // A data TPDU terminates the session.
        let dt = [0x03, 0x00, 0x00, 0x07, 0x02, 0xF0, 0x80];
        assert!(respond(ProtocolTag::S7, &dt).is_none());
    }

    #[test]
    fn iec104_startdt_and_testfr() {
        let startdt_act = [0x68, 0x04, 0x07, 0x00, 0x00, 0x00];
        assert_eq!(
            respond(ProtocolTag::Iec104, &startdt_act).unwrap(),
            vec![0x68, 0x04, 0x0B, 0x00, 0x00, 0x00]
        );
        let testfr_act = [0x68, 0x04, 0x43, 0x00, 0x00, 0x00];
        assert_eq!(
            respond(ProtocolTag::Iec104, &testfr_act).unwrap(),
            vec![0x68, 0x04, 0x83, 0x00, 0x00, 0x00]
        );
        // An I-frame is beyond the minimal surface.
        let i_frame = [0x68, 0x0E, 0x02, 0x00, 0x02, 0x00];
        assert!(respond(ProtocolTag::Iec104, &i_frame).is_none());
    }

    #[test]
    fn opcua_hello_gets_acknowledge() {
        let mut hel = Vec::new();
        hel.extend_from_slice(b"HELF");
        hel.extend_from_slice(&32u32.to_le_bytes());
        hel.extend_from_slice(&0u32.to_le_bytes());
        hel.extend_from_slice(&[0u8; 20]);
        let ack = respond(ProtocolTag::OpcUa, &hel).unwrap();
        assert_eq!(&ack[..4], b"ACKF");
        assert_eq!(ack.len(), 28);
    }

    #[test]
    fn enip_register_session_grants_handle() {
        let mut req = vec![0u8; 24];
        req[0..2].copy_from_slice(&0x0065u16.to_le_bytes());
        req[12..20].copy_from_slice(b"ctx-echo");
        let resp = respond(ProtocolTag::EthernetIp, &req).unwrap();
        assert_eq!(u16::from_le_bytes([resp[0], resp[1]]), 0x0065);
        assert_eq!(u32::from_le_bytes([resp[4], resp[5], resp[6], resp[7]]), 1);
        assert_eq!(&resp[12..20], b"ctx-echo");
    }

    #[test]
    fn dnp3_link_status_round_trip() {
        let mut req = vec![0x05, 0x64, 0x05, 0xC9, 0x01, 0x00, 0x02, 0x00];
        let crc = crc_dnp(&req);
        req.extend_from_slice(&crc.to_le_bytes());
        let resp = respond(ProtocolTag::Dnp3, &req).unwrap();
        assert_eq!(&resp[..2], &[0x05, 0x64]);
        assert_eq!(resp[3], 0x0B); // LINK_STATUS
        // Addresses swapped: response goes to the requester.
        assert_eq!(&resp[4..6], &[0x02, 0x00]);
        assert_eq!(&resp[6..8], &[0x01, 0x00]);
        // Header CRC verifies.
        let expect = crc_dnp(&resp[..8]);
        assert_eq!(u16::from_le_bytes([resp[8], resp[9]]), expect);
    }

    #[test]
    fn unknown_traffic_closes() {
        assert!(respond(ProtocolTag::S7, b"GET / HTTP/1.1\r\n").is_none());
        assert!(respond(ProtocolTag::Dnp3, &[0xFF; 16]).is_none());
        assert!(respond(ProtocolTag::OpcUa, b"NOPE").is_none());
    }
}
