//! SIP transport layer - UDP datagrams in and out

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 65535;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    /// Value used for the `transport=` URI parameter
    pub fn param(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
        }
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Sending half of a transport, shared by the transaction layer
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to a `host:port` destination
    async fn send(&self, data: Bytes, destination: &str) -> Result<(), SipError>;

    fn local_addr(&self) -> SocketAddr;

    fn protocol(&self) -> TransportProtocol;
}

/// Resolve a `host:port` destination, using DNS only when it is not a literal address
pub async fn resolve(destination: &str) -> Result<SocketAddr, SipError> {
    if let Ok(addr) = destination.parse::<SocketAddr>() {
        return Ok(addr);
    }

    lookup_host(destination)
        .await
        .map_err(|e| SipError::TransportError(format!("Failed to resolve {}: {}", destination, e)))?
        .next()
        .ok_or_else(|| SipError::TransportError(format!("No address for {}", destination)))
}

/// UDP transport implementation
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind the socket and start the receive loop.
    ///
    /// Parsed messages are delivered on the returned channel.
    pub async fn bind(
        bind_addr: SocketAddr,
    ) -> Result<(Self, mpsc::Receiver<IncomingMessage>), SipError> {
        info!("Starting UDP transport on {}", bind_addr);

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(1000);

        let recv_socket = socket.clone();
        tokio::spawn(async move {
            Self::receive_loop(recv_socket, tx).await;
        });

        Ok((Self { socket, local_addr }, rx))
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLFs carry no message
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Udp,
                            };

                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    warn!("Failed to receive UDP packet: {}", e);
                    if tx.is_closed() {
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: Bytes, destination: &str) -> Result<(), SipError> {
        let target = resolve(destination).await?;

        debug!("Sending {} bytes to {} via UDP", data.len(), target);

        self.socket
            .send_to(&data, target)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }
}
