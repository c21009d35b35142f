//! Modbus TCP listener.
//!
//! One TCP acceptor per device endpoint. Accepted sockets pass through the
//! reachability gate before any session task exists; denied peers see the
//! socket close with nothing sent. Sessions process requests strictly in
//! arrival order and serve everything from the listener's mirror.
//!
//! Unit-id policy: strict matching, silent drop on mismatch (field-device
//! behaviour; exception 0x0B is a gateway semantic).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use pal_common::consts::{MAX_SESSIONS_PER_LISTENER, MODBUS_IDLE_TIMEOUT_S, SESSION_DRAIN_MS};
use pal_common::device::ProtocolTag;
use pal_fabric::ClockHandle;
use pal_net::{Admission, ReachabilityGate};

use super::codec::{self, DeviceIdentity, MbapHeader};
use crate::mirror::SharedMirror;
use crate::{ProtocolError, ProtocolResult, ProtocolServer};

/// Modbus listener configuration.
#[derive(Debug, Clone)]
pub struct ModbusServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (0 lets the OS choose).
    pub port: u16,
    /// Unit id this listener answers for.
    pub unit_id: u8,
    /// Idle session timeout.
    pub idle_timeout: Duration,
    /// Concurrent session cap.
    pub session_cap: usize,
}

impl ModbusServerConfig {
    /// Conventional configuration for a host/port/unit triple.
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            idle_timeout: Duration::from_secs(MODBUS_IDLE_TIMEOUT_S),
            session_cap: MAX_SESSIONS_PER_LISTENER,
        }
    }
}

/// Modbus TCP server bound to one device.
pub struct ModbusServer {
    device: String,
    cfg: ModbusServerConfig,
    mirror: SharedMirror,
    identity: DeviceIdentity,
    gate: Arc<ReachabilityGate>,
    clock: ClockHandle,
    bound_port: u16,
    sessions: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl ModbusServer {
    /// Create a stopped server. The mirror should carry the device's boot
    /// snapshot.
    pub fn new(
        device: impl Into<String>,
        cfg: ModbusServerConfig,
        mirror: SharedMirror,
        gate: Arc<ReachabilityGate>,
        clock: ClockHandle,
    ) -> Self {
        let device = device.into();
        let identity = DeviceIdentity::for_device(&device);
        let (shutdown, _) = watch::channel(false);
        Self {
            device,
            cfg,
            mirror,
            identity,
            gate,
            clock,
            bound_port: 0,
            sessions: Arc::new(AtomicUsize::new(0)),
            shutdown,
            accept_task: None,
        }
    }

    /// Active session count.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProtocolServer for ModbusServer {
    fn device(&self) -> &str {
        &self.device
    }

    fn protocol(&self) -> ProtocolTag {
        ProtocolTag::ModbusTcp
    }

    fn port(&self) -> u16 {
        if self.bound_port != 0 {
            self.bound_port
        } else {
            self.cfg.port
        }
    }

    fn mirror(&self) -> SharedMirror {
        self.mirror.clone()
    }

    async fn start(&mut self) -> ProtocolResult<()> {
        if self.accept_task.is_some() {
            return Err(ProtocolError::Lifecycle("already started"));
        }
        let addr = format!("{}:{}", self.cfg.host, self.cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProtocolError::BindFailed { addr, source })?;
        self.bound_port = listener.local_addr()?.port();
        info!(
            device = %self.device,
            port = self.bound_port,
            unit_id = self.cfg.unit_id,
            "modbus listener up"
        );

        let ctx = AcceptContext {
            device: self.device.clone(),
            cfg: self.cfg.clone(),
            port: self.bound_port,
            mirror: self.mirror.clone(),
            identity: self.identity.clone(),
            gate: self.gate.clone(),
            clock: self.clock.clone(),
            sessions: self.sessions.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        self.accept_task = Some(tokio::spawn(accept_loop(listener, ctx)));
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        // Drain window: sessions observe the shutdown signal and exit.
        let deadline = Duration::from_millis(SESSION_DRAIN_MS);
        let _ = timeout(deadline, async {
            while self.sessions.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        let remaining = self.sessions.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!(device = %self.device, remaining, "sessions still open after drain window");
        }
        info!(device = %self.device, "modbus listener stopped");
    }
}

struct AcceptContext {
    device: String,
    cfg: ModbusServerConfig,
    port: u16,
    mirror: SharedMirror,
    identity: DeviceIdentity,
    gate: Arc<ReachabilityGate>,
    clock: ClockHandle,
    sessions: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

async fn accept_loop(listener: TcpListener, mut ctx: AcceptContext) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(device = %ctx.device, error = %e, "accept failed");
                continue;
            }
        };

        // Admission before any session task exists.
        let admission = ctx.gate.admit(
            peer,
            &ctx.device,
            ProtocolTag::ModbusTcp,
            ctx.port,
            ctx.clock.now(),
        );
        if matches!(admission, Admission::Denied { .. }) {
            drop(stream);
            continue;
        }

        if ctx.sessions.load(Ordering::Relaxed) >= ctx.cfg.session_cap {
            warn!(device = %ctx.device, %peer, "session cap reached, refusing");
            drop(stream);
            continue;
        }

        ctx.sessions.fetch_add(1, Ordering::Relaxed);
        debug!(device = %ctx.device, %peer, "modbus session open");
        let session = SessionContext {
            device: ctx.device.clone(),
            unit_id: ctx.cfg.unit_id,
            idle_timeout: ctx.cfg.idle_timeout,
            mirror: ctx.mirror.clone(),
            identity: ctx.identity.clone(),
            sessions: ctx.sessions.clone(),
            shutdown: ctx.shutdown.clone(),
        };
        tokio::spawn(run_session(stream, session));
    }
    debug!(device = %ctx.device, "accept loop exited");
}

struct SessionContext {
    device: String,
    unit_id: u8,
    idle_timeout: Duration,
    mirror: SharedMirror,
    identity: DeviceIdentity,
    sessions: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

async fn run_session(mut stream: TcpStream, mut ctx: SessionContext) {
    loop {
        let mut header = [0u8; 7];
        let read = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            read = timeout(ctx.idle_timeout, stream.read_exact(&mut header)) => read,
        };
        match read {
            Err(_) => {
                debug!(device = %ctx.device, "session idle timeout");
                break;
            }
            Ok(Err(_)) => break, // peer closed
            Ok(Ok(_)) => {}
        }

        let mbap = match MbapHeader::parse(&header) {
            Ok(mbap) => mbap,
            Err(e) => {
                // Not Modbus TCP at all: terminate the session.
                debug!(device = %ctx.device, ?e, "bad MBAP header, closing session");
                break;
            }
        };

        let mut pdu = vec![0u8; mbap.length as usize - 1];
        match timeout(ctx.idle_timeout, stream.read_exact(&mut pdu)).await {
            Ok(Ok(_)) => {}
            _ => break,
        }

        // Strict unit-id policy: silently drop mismatches.
        if mbap.unit_id != ctx.unit_id {
            trace!(
                device = %ctx.device,
                got = mbap.unit_id,
                expected = ctx.unit_id,
                "unit id mismatch, dropping request"
            );
            continue;
        }

        let response = match codec::parse_request(&pdu) {
            Ok(req) => codec::handle_request(&req, &ctx.mirror, &ctx.identity),
            Err((fc, code)) => codec::exception_pdu(fc, code),
        };

        let mut frame = Vec::with_capacity(7 + response.len());
        frame.extend_from_slice(&MbapHeader::encode(
            mbap.transaction_id,
            mbap.unit_id,
            response.len(),
        ));
        frame.extend_from_slice(&response);
        if stream.write_all(&frame).await.is_err() {
            break;
        }
    }
    ctx.sessions.fetch_sub(1, Ordering::Relaxed);
    debug!(device = %ctx.device, "modbus session closed");
}
