//! SIP server: binds the transport and feeds the dispatcher

use super::endpoint::Endpoint;
use super::handler::SipService;
use super::message::SipError;
use super::transaction::SipTimers;
use super::transport::{IncomingMessage, Transport, UdpTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// SIP server configuration
#[derive(Debug, Clone)]
pub struct SipServerConfig {
    pub udp_bind: SocketAddr,
    /// Host this hop advertises in Via and Record-Route
    pub advertised_host: String,
    /// Port advertised alongside `advertised_host`; 0 uses the bound port
    pub advertised_port: u16,
    pub timers: SipTimers,
}

/// SIP server
pub struct SipServer {
    endpoint: Arc<Endpoint>,
    local_addr: SocketAddr,
    incoming: Option<mpsc::Receiver<IncomingMessage>>,
}

impl SipServer {
    /// Bind the UDP transport and build the endpoint on top of it
    pub async fn bind(config: SipServerConfig) -> Result<Self, SipError> {
        let (transport, incoming) = UdpTransport::bind(config.udp_bind).await?;
        let local_addr = transport.local_addr();
        let port = match config.advertised_port {
            0 => local_addr.port(),
            port => port,
        };

        let endpoint = Arc::new(Endpoint::new(
            Arc::new(transport),
            config.advertised_host,
            port,
            config.timers,
        ));
        info!("UDP transport started on {}", local_addr);

        Ok(Self {
            endpoint,
            local_addr,
            incoming: Some(incoming),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The endpoint doubles as the outbound leg of the service
    pub fn endpoint(&self) -> Arc<Endpoint> {
        self.endpoint.clone()
    }

    /// Start processing messages; every request runs in its own task
    pub fn start(&mut self, service: Arc<SipService>) -> Result<JoinHandle<()>, SipError> {
        let mut rx = self
            .incoming
            .take()
            .ok_or_else(|| SipError::Internal("SIP server already started".to_string()))?;
        let endpoint = self.endpoint.clone();

        let handle = tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                let Some(request) = endpoint.receive(incoming).await else {
                    continue;
                };
                let service = service.clone();
                tokio::spawn(async move {
                    service.dispatch(request).await;
                });
            }
            debug!("SIP transport closed, message loop finished");
        });

        info!("SIP server started on {}", self.endpoint.address());
        Ok(handle)
    }
}
