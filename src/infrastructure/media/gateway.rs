//! Media gateway: answers SDP offers and carries received RTP into an audio track

use crate::infrastructure::protocols::sip::sdp::SdpSession;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Largest RTP datagram accepted from the network
const RTP_BUFFER_SIZE: usize = 1500;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Failed to bind media listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Invalid SDP offer: {0}")]
    InvalidOffer(String),
}

/// Session negotiation and media transport for locally answered INVITEs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaGateway: Send + Sync {
    /// Open a media listener and return its port
    async fn allocate_listener(&self) -> Result<u16, MediaError>;

    /// Produce the SDP answer for `offer`, pointing at `local_address:port`
    async fn negotiate(
        &self,
        offer: &[u8],
        local_address: &str,
        port: u16,
    ) -> Result<Vec<u8>, MediaError>;
}

/// RTP gateway feeding every listener into one broadcast audio track
pub struct RtpGateway {
    bind_address: IpAddr,
    track: broadcast::Sender<Bytes>,
}

impl RtpGateway {
    pub fn new(bind_address: IpAddr, track_capacity: usize) -> Self {
        let (track, _) = broadcast::channel(track_capacity.max(1));
        Self {
            bind_address,
            track,
        }
    }

    /// Attach a consumer to the audio track
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.track.subscribe()
    }

    async fn forward(socket: UdpSocket, track: broadcast::Sender<Bytes>) {
        let mut buf = vec![0u8; RTP_BUFFER_SIZE];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    // No subscribers is not an error, the packet is just dropped
                    let _ = track.send(Bytes::copy_from_slice(&buf[..size]));
                    debug!("RTP: {} bytes from {}", size, source);
                }
                Err(e) => {
                    warn!("RTP listener stopped: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl MediaGateway for RtpGateway {
    async fn allocate_listener(&self) -> Result<u16, MediaError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_address, 0)).await?;
        let port = socket.local_addr()?.port();

        info!("RTP listener on {}:{}", self.bind_address, port);
        tokio::spawn(Self::forward(socket, self.track.clone()));

        Ok(port)
    }

    async fn negotiate(
        &self,
        offer: &[u8],
        local_address: &str,
        port: u16,
    ) -> Result<Vec<u8>, MediaError> {
        let text = std::str::from_utf8(offer)
            .map_err(|e| MediaError::InvalidOffer(e.to_string()))?;
        let offer = SdpSession::parse(text)
            .ok_or_else(|| MediaError::InvalidOffer("unparsable session description".to_string()))?;
        let answer = SdpSession::pcmu_answer(&offer, local_address, port).ok_or_else(|| {
            MediaError::InvalidOffer(format!(
                "non-numeric session id {}",
                offer.origin.session_id
            ))
        })?;

        Ok(answer.to_string().into_bytes())
    }
}
