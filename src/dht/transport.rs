//! Transport seam.
//!
//! The core consumes a [`Transport`]: a sink/source of framed packets. The
//! UDP implementation here is what the node binary runs on; overlay
//! addresses (onion, i2p, nym, loki) are not routable over it and yield
//! [`TransportError::Unroutable`]; reaching them is a proxying transport's
//! job. [`ChannelTransport`] is the in-memory double used by tests and
//! local wiring.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dht::address::Address;
use crate::dht::packet::{Packet, PacketType};

/// Largest datagram the UDP transport will frame or accept.
pub const MAX_PACKET_SIZE: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address not routable over this transport: {0}")]
    Unroutable(String),

    #[error("packet too large: {0} bytes")]
    Oversized(usize),

    #[error("send timed out")]
    Timeout,

    #[error("transport closed")]
    Closed,
}

/// Receives inbound packets for one registered packet type.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn deliver(&self, packet: Packet, from: Address);
}

/// Framed-packet sink/source consumed by the DHT core.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, packet: &Packet, addr: &Address) -> Result<(), TransportError>;

    /// Route inbound packets of this type to `sink`, replacing any previous
    /// registration.
    fn register_handler(&self, packet_type: PacketType, sink: Arc<dyn PacketSink>);

    fn local_addr(&self) -> Option<SocketAddr>;

    async fn close(&self);
}

type HandlerMap = RwLock<HashMap<u8, Arc<dyn PacketSink>>>;

fn frame(packet: &Packet) -> Result<Vec<u8>, TransportError> {
    if packet.data.len() + 1 > MAX_PACKET_SIZE {
        return Err(TransportError::Oversized(packet.data.len() + 1));
    }
    let mut buf = Vec::with_capacity(packet.data.len() + 1);
    buf.push(packet.packet_type.as_wire());
    buf.extend_from_slice(&packet.data);
    Ok(buf)
}

async fn dispatch(handlers: &HandlerMap, buf: &[u8], from: SocketAddr) {
    let Some((&type_byte, data)) = buf.split_first() else {
        return;
    };
    let Ok(packet_type) = PacketType::from_wire(type_byte) else {
        debug!(from = %from, packet_type = type_byte, "dropping packet of unknown type");
        return;
    };
    let sink = {
        let handlers = handlers.read().expect("handler lock poisoned");
        handlers.get(&type_byte).cloned()
    };
    match sink {
        Some(sink) => {
            let packet = Packet::new(packet_type, data.to_vec());
            sink.deliver(packet, Address::from_socket_addr(from)).await;
        }
        None => debug!(from = %from, packet = packet_type.name(), "no handler registered"),
    }
}

// =============================================================================
// UDP
// =============================================================================

/// UDP datagram transport: one socket, one reader task.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    handlers: Arc<HandlerMap>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind `0.0.0.0:port` (0 for ephemeral), enable broadcast for LAN
    /// discovery, and start the reader task.
    pub async fn bind(port: u16) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        socket.set_broadcast(true)?;

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let socket = transport.socket.clone();
        let handlers = transport.handlers.clone();
        let cancel = transport.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = socket.recv_from(&mut buf) => match recv {
                        Ok((len, from)) => dispatch(&handlers, &buf[..len], from).await,
                        Err(e) => {
                            warn!(error = %e, "udp receive failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(transport)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, packet: &Packet, addr: &Address) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let socket_addr = addr
            .to_socket_addr()
            .ok_or_else(|| TransportError::Unroutable(addr.to_string()))?;
        let buf = frame(packet)?;
        self.socket.send_to(&buf, socket_addr).await?;
        Ok(())
    }

    fn register_handler(&self, packet_type: PacketType, sink: Arc<dyn PacketSink>) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .insert(packet_type.as_wire(), sink);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

// =============================================================================
// IN-MEMORY DOUBLE
// =============================================================================

/// In-memory transport for tests and local wiring: records outbound packets
/// and lets callers inject inbound ones.
pub struct ChannelTransport {
    local: SocketAddr,
    sent: Mutex<Vec<(Packet, Address)>>,
    handlers: HandlerMap,
    fail_sends: AtomicBool,
}

impl ChannelTransport {
    pub fn new(local: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local,
            sent: Mutex::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Make every subsequent `send` fail, to exercise best-effort paths.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Drain everything sent so far.
    pub fn take_sent(&self) -> Vec<(Packet, Address)> {
        std::mem::take(&mut self.sent.lock().expect("sent lock poisoned"))
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent lock poisoned").len()
    }

    /// Deliver an inbound packet to the registered handler, as the wire
    /// would.
    pub async fn inject(&self, packet: Packet, from: Address) {
        let sink = {
            let handlers = self.handlers.read().expect("handler lock poisoned");
            handlers.get(&packet.packet_type.as_wire()).cloned()
        };
        if let Some(sink) = sink {
            sink.deliver(packet, from).await;
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, packet: &Packet, addr: &Address) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if addr.to_socket_addr().is_none() {
            return Err(TransportError::Unroutable(addr.to_string()));
        }
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .push((packet.clone(), addr.clone()));
        Ok(())
    }

    fn register_handler(&self, packet_type: PacketType, sink: Arc<dyn PacketSink>) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .insert(packet_type.as_wire(), sink);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    async fn close(&self) {}
}
