//! SIP endpoint: matches inbound traffic to transactions and sends outbound requests

use super::headers;
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transaction::{
    start_client_transaction, start_server_transaction, ClientTransaction, ServerInput,
    ServerTransaction, SipTimers, TransactionContext, TransactionKey,
};
use super::transport::{IncomingMessage, Transport};
use async_trait::async_trait;
use rsip::typed;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header rewrites applied to a request before it leaves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Prepend a Via for this hop (and decrement Max-Forwards)
    pub add_via: bool,
    /// Insert `Record-Route: <sip:HOST:PORT;lr>`
    pub record_route: bool,
}

impl ForwardOptions {
    pub fn relay() -> Self {
        Self {
            add_via: true,
            record_route: true,
        }
    }

    pub fn via_only() -> Self {
        Self {
            add_via: true,
            record_route: false,
        }
    }
}

/// Outbound side of the router: how requests reach their next hop
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboundLeg: Send + Sync {
    /// Open a client transaction sending `request` to its destination
    async fn transaction_request(
        &self,
        request: SipRequest,
        options: ForwardOptions,
    ) -> Result<ClientTransaction, SipError>;

    /// Send `request` to its destination without a transaction
    async fn write_request(
        &self,
        request: SipRequest,
        options: ForwardOptions,
    ) -> Result<(), SipError>;

    /// Send `response` statelessly to its destination, or to its top Via
    async fn write_response(&self, response: SipResponse) -> Result<(), SipError>;
}

/// A request that needs the transaction user's attention
pub struct IncomingRequest {
    pub request: SipRequest,
    /// `None` for ACKs, which never create a server transaction
    pub transaction: Option<ServerTransaction>,
}

pub struct Endpoint {
    ctx: Arc<TransactionContext>,
    host: String,
    port: u16,
}

impl Endpoint {
    /// `host`/`port` is the address this hop advertises in Via and Record-Route.
    pub fn new(
        transport: Arc<dyn Transport>,
        host: impl Into<String>,
        port: u16,
        timers: SipTimers,
    ) -> Self {
        Self {
            ctx: Arc::new(TransactionContext::new(transport, timers)),
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn context(&self) -> &Arc<TransactionContext> {
        &self.ctx
    }

    /// `host:port` of this hop
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Feed one message from the transport.
    ///
    /// Returns the request when it starts a new transaction (or is an ACK
    /// no INVITE transaction claims). Everything else is consumed here.
    pub async fn receive(&self, incoming: IncomingMessage) -> Option<IncomingRequest> {
        match incoming.message {
            SipMessage::Request(request) => {
                let request = request
                    .with_source(incoming.source)
                    .with_protocol(incoming.protocol);
                self.receive_request(request).await
            }
            SipMessage::Response(response) => {
                self.receive_response(response).await;
                None
            }
        }
    }

    async fn receive_request(&self, mut request: SipRequest) -> Option<IncomingRequest> {
        if let (Some(via), Some(source)) =
            (headers::top_typed_via(request.headers()), request.source)
        {
            let annotated = headers::annotate_received(&via, source);
            if annotated != via {
                headers::replace_top_via(request.headers_mut(), annotated.to_string());
            }
        }

        let Some(branch) = request.branch() else {
            warn!(
                "Dropping {} without Via branch from {:?}",
                request.method_name(),
                request.source
            );
            return None;
        };
        let invite_key = TransactionKey::new(branch.clone(), "INVITE");

        if request.method() == SipMethod::Cancel
            && self
                .ctx
                .deliver_to_server(&invite_key, ServerInput::Cancel(request.clone()))
                .await
        {
            return None;
        }

        match request.method() {
            SipMethod::Ack => {
                if self
                    .ctx
                    .deliver_to_server(&invite_key, ServerInput::Ack(request.clone()))
                    .await
                {
                    return None;
                }
                Some(IncomingRequest {
                    request,
                    transaction: None,
                })
            }
            _ => {
                let key = TransactionKey::new(branch, request.method_name());
                if self
                    .ctx
                    .deliver_to_server(&key, ServerInput::Retransmission)
                    .await
                {
                    debug!("Retransmission of {}", key);
                    return None;
                }

                match start_server_transaction(&self.ctx, request.clone()).await {
                    Ok(transaction) => Some(IncomingRequest {
                        request,
                        transaction: Some(transaction),
                    }),
                    Err(e) => {
                        warn!("Failed to create server transaction: {}", e);
                        None
                    }
                }
            }
        }
    }

    async fn receive_response(&self, response: SipResponse) {
        if let Some(key) = TransactionKey::for_response(&response) {
            if self.ctx.deliver_to_client(&key, response.clone()).await {
                return;
            }
        }

        self.forward_stray_response(response).await;
    }

    /// Forward a response no client transaction claims (RFC 3261 16.7 / 18.2.2)
    async fn forward_stray_response(&self, mut response: SipResponse) {
        let ours = headers::top_typed_via(response.headers())
            .is_some_and(|via| self.is_own_sent_by(&via));
        if !ours {
            debug!(
                "Dropping stray {} response not addressed to this hop",
                response.status_code()
            );
            return;
        }

        headers::remove_top_via(response.headers_mut());
        let Some(target) =
            headers::top_typed_via(response.headers()).map(|via| headers::response_target(&via))
        else {
            debug!("Stray {} response has no further Via", response.status_code());
            return;
        };

        debug!(
            "Forwarding stray {} response to {}",
            response.status_code(),
            target
        );
        if let Err(e) = self
            .ctx
            .transport()
            .send(response.to_bytes(), &target)
            .await
        {
            warn!("Failed to forward stray response to {}: {}", target, e);
        }
    }

    fn is_own_sent_by(&self, via: &typed::Via) -> bool {
        let sent_by = &via.uri.host_with_port;
        sent_by.host.to_string().eq_ignore_ascii_case(&self.host)
            && sent_by.port.map(u16::from).unwrap_or(headers::DEFAULT_SIP_PORT) == self.port
    }

    /// Apply forwarding rewrites and return where the request goes
    fn prepare(&self, request: &mut SipRequest, options: ForwardOptions) -> Result<String, SipError> {
        let destination = request
            .destination
            .clone()
            .ok_or_else(|| SipError::InvalidMessage("Request has no destination".to_string()))?;

        if options.add_via {
            let max_forwards = request
                .max_forwards()
                .map(|value| value.saturating_sub(1))
                .unwrap_or(headers::DEFAULT_MAX_FORWARDS);
            headers::set_max_forwards(request.headers_mut(), max_forwards);

            let via = format!(
                "SIP/2.0/{} {};branch={}",
                self.ctx.transport().protocol().as_str(),
                self.address(),
                headers::generate_branch()
            );
            headers::prepend_via(request.headers_mut(), via);
        }

        if options.record_route {
            headers::prepend_record_route(
                request.headers_mut(),
                format!("<sip:{};lr>", self.address()),
            );
        }

        Ok(destination)
    }
}

#[async_trait]
impl OutboundLeg for Endpoint {
    async fn transaction_request(
        &self,
        mut request: SipRequest,
        options: ForwardOptions,
    ) -> Result<ClientTransaction, SipError> {
        let destination = self.prepare(&mut request, options)?;
        debug!(
            "Opening {} transaction towards {}",
            request.method_name(),
            destination
        );
        start_client_transaction(&self.ctx, request, destination).await
    }

    async fn write_request(
        &self,
        mut request: SipRequest,
        options: ForwardOptions,
    ) -> Result<(), SipError> {
        let destination = self.prepare(&mut request, options)?;
        debug!("Writing {} to {}", request.method_name(), destination);
        self.ctx
            .transport()
            .send(request.to_bytes(), &destination)
            .await
    }

    async fn write_response(&self, response: SipResponse) -> Result<(), SipError> {
        let destination = response
            .destination
            .clone()
            .or_else(|| {
                headers::top_typed_via(response.headers()).map(|via| headers::response_target(&via))
            })
            .ok_or_else(|| SipError::InvalidMessage("Response has no destination".to_string()))?;

        debug!("Writing {} response to {}", response.status_code(), destination);
        self.ctx
            .transport()
            .send(response.to_bytes(), &destination)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
    use crate::infrastructure::protocols::sip::transport::{TransportProtocol, UdpTransport};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
                          Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKorig;rport\r\n\
                          Max-Forwards: 70\r\n\
                          From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                          To: Bob <sip:bob@example.com>\r\n\
                          Call-ID: ep-1@10.0.0.5\r\n\
                          CSeq: 1 INVITE\r\n\
                          Content-Length: 0\r\n\r\n";

    async fn endpoint() -> (Endpoint, mpsc::Receiver<IncomingMessage>) {
        let (transport, rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let port = transport.local_addr().port();
        (
            Endpoint::new(Arc::new(transport), "127.0.0.1", port, SipTimers::default()),
            rx,
        )
    }

    async fn recv_text(socket: &UdpSocket) -> String {
        let mut buf = vec![0u8; 65535];
        let (size, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..size]).to_string()
    }

    #[tokio::test]
    async fn test_write_request_adds_via_and_decrements_max_forwards() {
        let (endpoint, _rx) = endpoint().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut request = SipRequest::parse(INVITE.as_bytes()).unwrap();
        request.set_destination(peer.local_addr().unwrap().to_string());
        endpoint
            .write_request(request, ForwardOptions::relay())
            .await
            .unwrap();

        let sent = SipRequest::parse(recv_text(&peer).await.as_bytes()).unwrap();
        assert_eq!(headers::via_count(sent.headers()), 2);
        assert_eq!(sent.max_forwards(), Some(69));
        let top = headers::top_via(sent.headers()).unwrap();
        assert!(top.contains(&endpoint.address()));
        assert_eq!(headers::record_route_count(sent.headers()), 1);
    }

    #[tokio::test]
    async fn test_write_response_goes_to_request_source() {
        let (endpoint, _rx) = endpoint().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let request = SipRequest::parse(INVITE.as_bytes())
            .unwrap()
            .with_source(peer.local_addr().unwrap());
        let response = ResponseBuilder::server_internal_error().build_for_request(&request);
        endpoint.write_response(response).await.unwrap();

        let sent = SipResponse::parse(recv_text(&peer).await.as_bytes()).unwrap();
        assert_eq!(sent.status_code(), 500);
        assert_eq!(sent.via_count(), 1);
        assert_eq!(sent.branch().as_deref(), Some("z9hG4bKorig"));
    }

    #[tokio::test]
    async fn test_received_request_keeps_arrival_transport() {
        let (endpoint, _rx) = endpoint().await;

        let incoming = endpoint
            .receive(IncomingMessage {
                message: SipMessage::parse(INVITE.as_bytes()).unwrap(),
                source: "10.0.0.5:5062".parse().unwrap(),
                protocol: TransportProtocol::Tcp,
            })
            .await
            .unwrap();

        assert_eq!(incoming.request.transport(), TransportProtocol::Tcp);
        assert_eq!(incoming.request.source, Some("10.0.0.5:5062".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_missing_destination_is_an_error() {
        let (endpoint, _rx) = endpoint().await;
        let request = SipRequest::parse(INVITE.as_bytes()).unwrap();
        let result = endpoint
            .transaction_request(request, ForwardOptions::relay())
            .await;
        assert!(matches!(result, Err(SipError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_inbound_invite_creates_transaction_and_matches_cancel() {
        let (endpoint, _rx) = endpoint().await;
        let source = "10.0.0.5:5062".parse().unwrap();

        let invite = SipMessage::parse(INVITE.as_bytes()).unwrap();
        let incoming = endpoint
            .receive(IncomingMessage {
                message: invite.clone(),
                source,
                protocol: TransportProtocol::Udp,
            })
            .await
            .unwrap();
        let mut transaction = incoming.transaction.unwrap();

        // Source annotations land on the top Via
        let via = headers::top_via(incoming.request.headers()).unwrap();
        assert!(via.contains("rport=5062"));
        assert!(via.contains("received=10.0.0.5"));

        // Retransmission is absorbed
        let again = endpoint
            .receive(IncomingMessage {
                message: invite,
                source,
                protocol: TransportProtocol::Udp,
            })
            .await;
        assert!(again.is_none());

        let cancel = INVITE
            .replace("INVITE sip:", "CANCEL sip:")
            .replace("CSeq: 1 INVITE", "CSeq: 1 CANCEL");
        let consumed = endpoint
            .receive(IncomingMessage {
                message: SipMessage::parse(cancel.as_bytes()).unwrap(),
                source,
                protocol: TransportProtocol::Udp,
            })
            .await;
        assert!(consumed.is_none());

        let delivered = tokio::time::timeout(Duration::from_secs(1), transaction.cancels.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.method(), SipMethod::Cancel);
    }

    #[tokio::test]
    async fn test_unmatched_ack_is_returned_without_transaction() {
        let (endpoint, _rx) = endpoint().await;
        let ack = INVITE
            .replace("INVITE sip:", "ACK sip:")
            .replace("CSeq: 1 INVITE", "CSeq: 1 ACK")
            .replace("z9hG4bKorig", "z9hG4bKack2xx");

        let incoming = endpoint
            .receive(IncomingMessage {
                message: SipMessage::parse(ack.as_bytes()).unwrap(),
                source: "10.0.0.5:5060".parse().unwrap(),
                protocol: TransportProtocol::Udp,
            })
            .await
            .unwrap();
        assert!(incoming.transaction.is_none());
        assert_eq!(endpoint.context().server_count().await, 0);
    }

    #[tokio::test]
    async fn test_stray_response_forwarded_to_next_via() {
        let (endpoint, _rx) = endpoint().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let response = format!(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP {};branch=z9hG4bKgone\r\n\
             Via: SIP/2.0/UDP {};branch=z9hG4bKcaller\r\n\
             From: <sip:alice@example.com>;tag=1\r\n\
             To: <sip:bob@example.com>;tag=2\r\n\
             Call-ID: stray-1\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n",
            endpoint.address(),
            peer.local_addr().unwrap()
        );
        endpoint
            .receive(IncomingMessage {
                message: SipMessage::parse(response.as_bytes()).unwrap(),
                source: "10.0.0.7:5060".parse().unwrap(),
                protocol: TransportProtocol::Udp,
            })
            .await;

        let forwarded = SipResponse::parse(recv_text(&peer).await.as_bytes()).unwrap();
        assert_eq!(forwarded.via_count(), 1);
        assert_eq!(forwarded.branch().as_deref(), Some("z9hG4bKcaller"));
    }
}
