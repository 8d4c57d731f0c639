//! SIP request dispatch
//!
//! `SipService` classifies every request the endpoint hands up and runs the
//! matching behaviour: registration, local INVITE answering, stateless ACK
//! forwarding, MESSAGE logging, and the relay loop for everything else.

use super::builder::ResponseBuilder;
use super::endpoint::{ForwardOptions, IncomingRequest, OutboundLeg};
use super::message::{SipMethod, SipRequest, SipResponse};
use super::registrar::Registrar;
use super::router::RelayLoop;
use super::transaction::ServerTransaction;
use crate::config::InviteMode;
use crate::domain::registry::Registry;
use crate::domain::routing::DestinationResolver;
use crate::infrastructure::media::{MediaError, MediaGateway};
use metrics::counter;
use rsip::headers::UntypedHeader;
use rsip::{typed, Header};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-process settings the dispatcher needs
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Address advertised in Contact and SDP
    pub local_ip: String,
    pub sip_port: u16,
    pub user_agent: String,
    pub invite_mode: InviteMode,
    /// Used when the target user is not registered; empty for none
    pub fallback_destination: String,
    /// 0 leaves relay exchanges unbounded
    pub max_concurrent_exchanges: usize,
}

pub struct SipService {
    registrar: Registrar,
    relay: RelayLoop,
    media: Arc<dyn MediaGateway>,
    settings: ServiceSettings,
}

impl SipService {
    pub fn new(
        registry: Arc<dyn Registry>,
        leg: Arc<dyn OutboundLeg>,
        media: Arc<dyn MediaGateway>,
        settings: ServiceSettings,
    ) -> Self {
        let registrar = Registrar::new(
            registry.clone(),
            &settings.local_ip,
            settings.sip_port,
            settings.user_agent.clone(),
        );
        let resolver = DestinationResolver::new(registry, settings.fallback_destination.clone());
        let relay = RelayLoop::new(leg, resolver, settings.max_concurrent_exchanges);

        Self {
            registrar,
            relay,
            media,
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        self.registrar.registry()
    }

    /// Handle one request to completion
    pub async fn dispatch(&self, incoming: IncomingRequest) {
        let IncomingRequest {
            request,
            transaction,
        } = incoming;
        let method = request.method();

        counter!("sip_requests_total", "method" => method.as_str()).increment(1);
        debug!(
            method = %request.method_name(),
            call_id = ?request.call_id(),
            source = ?request.source,
            "Dispatching request"
        );

        let Some(transaction) = transaction else {
            if method == SipMethod::Ack {
                self.on_ack(request).await;
            } else {
                warn!("{} arrived without a transaction, dropped", request.method_name());
            }
            return;
        };

        match method {
            SipMethod::Register => self.on_register(request, transaction).await,
            SipMethod::Invite => self.on_invite(request, transaction).await,
            SipMethod::Ack => self.on_ack(request).await,
            SipMethod::Cancel => self.on_cancel(request, transaction).await,
            SipMethod::Bye => self.on_bye(request, transaction).await,
            SipMethod::Message => self.on_message(request, transaction).await,
            SipMethod::Other => self.on_other(request, transaction).await,
        }
    }

    async fn on_register(&self, request: SipRequest, transaction: ServerTransaction) {
        let (_, response) = self.registrar.handle_register(&request).await;
        respond(&transaction, response).await;
    }

    async fn on_invite(&self, request: SipRequest, transaction: ServerTransaction) {
        if self.settings.invite_mode == InviteMode::Relay {
            self.relay.run(request, transaction).await;
            return;
        }

        let response = match self.answer(&request).await {
            Ok(answer) => {
                info!(
                    "Accepting SIP Invite: {:?}",
                    request.from_header().map(|from| from.to_string())
                );
                ResponseBuilder::ok()
                    .header(Header::Contact(self.local_contact().into()))
                    .header(Header::ContentType(rsip::headers::ContentType::new(
                        "application/sdp",
                    )))
                    .server(&self.settings.user_agent)
                    .body(answer)
                    .build_for_request(&request)
            }
            Err(e) => {
                error!(call_id = ?request.call_id(), "Media negotiation failed: {}", e);
                ResponseBuilder::server_internal_error()
                    .server(&self.settings.user_agent)
                    .build_for_request(&request)
            }
        };

        respond(&transaction, response).await;
    }

    fn local_contact(&self) -> typed::Contact {
        typed::Contact::from(rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: None,
            host_with_port: rsip::HostWithPort {
                host: rsip::Host::from(self.settings.local_ip.as_str()),
                port: Some(self.settings.sip_port.into()),
            },
            params: vec![],
            headers: vec![],
        })
    }

    async fn answer(&self, request: &SipRequest) -> Result<Vec<u8>, MediaError> {
        let port = self.media.allocate_listener().await?;
        self.media
            .negotiate(request.body(), &self.settings.local_ip, port)
            .await
    }

    /// ACKs for 2xx travel end to end without a transaction
    async fn on_ack(&self, request: SipRequest) {
        let Some(destination) = self.relay.resolver().resolve_request(&request).await else {
            debug!("ACK for {:?} has no destination, dropped", request.to_user());
            return;
        };

        let mut forward = request.clone();
        forward.set_destination(destination.clone());
        let Err(e) = self
            .relay
            .leg()
            .write_request(forward, ForwardOptions::via_only())
            .await
        else {
            info!(destination = %destination, "ACK forwarded");
            return;
        };

        error!("Send failed for ACK to {}: {}", destination, e);
        // Best effort, straight back to where the ACK came from
        let response = ResponseBuilder::server_internal_error()
            .server(&self.settings.user_agent)
            .build_for_request(&request);
        if let Err(e) = self.relay.leg().write_response(response).await {
            warn!("Could not answer failed ACK from {:?}: {}", request.source, e);
        }
    }

    async fn on_cancel(&self, request: SipRequest, transaction: ServerTransaction) {
        info!(call_id = ?request.call_id(), "CANCEL without matching INVITE, routing");
        self.relay.run(request, transaction).await;
    }

    async fn on_bye(&self, request: SipRequest, transaction: ServerTransaction) {
        info!(call_id = ?request.call_id(), "BYE received");
        self.relay.run(request, transaction).await;
    }

    async fn on_message(&self, request: SipRequest, transaction: ServerTransaction) {
        info!(
            body = %String::from_utf8_lossy(request.body()),
            from = ?request.from_header().map(|from| from.to_string()),
            "MESSAGE received"
        );
        let response = ResponseBuilder::ok()
            .server(&self.settings.user_agent)
            .build_for_request(&request);
        respond(&transaction, response).await;
    }

    async fn on_other(&self, request: SipRequest, transaction: ServerTransaction) {
        debug!(method = %request.method_name(), "Routing request");
        self.relay.run(request, transaction).await;
    }
}

async fn respond(transaction: &ServerTransaction, response: SipResponse) {
    let code = response.status_code();
    if let Err(e) = transaction.respond(response).await {
        error!("Fail to respond {} on transaction {}: {}", code, transaction.key(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::InMemoryRegistry;
    use crate::infrastructure::media::gateway::MockMediaGateway;
    use crate::infrastructure::protocols::sip::endpoint::MockOutboundLeg;
    use crate::infrastructure::protocols::sip::message::SipError;
    use crate::infrastructure::protocols::sip::transaction::{
        ClientTransaction, ServerCommand, TransactionKey,
    };
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use tokio_test::assert_ok;

    struct InboundSide {
        commands: mpsc::Receiver<ServerCommand>,
        _acks: mpsc::Sender<SipRequest>,
        _cancels: mpsc::Sender<SipRequest>,
        done: Option<oneshot::Sender<Result<(), SipError>>>,
    }

    impl InboundSide {
        async fn response(&mut self) -> SipResponse {
            let command = tokio::time::timeout(Duration::from_secs(2), self.commands.recv())
                .await
                .expect("no command")
                .expect("commands closed");
            match command {
                ServerCommand::Respond(response) => response,
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    fn request(method: &str, extra: &str, body: &str) -> SipRequest {
        let data = format!(
            "{method} sip:alice@10.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.9:5070;branch=z9hG4bK{method}\r\n\
             Max-Forwards: 70\r\n\
             From: Bob <sip:bob@10.0.0.1>;tag=4711\r\n\
             To: <sip:alice@10.0.0.1>\r\n\
             Call-ID: svc-1@10.0.0.9\r\n\
             CSeq: 1 {method}\r\n\
             {extra}\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        );
        SipRequest::parse(data.as_bytes())
            .unwrap()
            .with_source("10.0.0.9:5070".parse().unwrap())
    }

    fn incoming(request: SipRequest) -> (IncomingRequest, InboundSide) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();
        let transaction = ServerTransaction::new(
            TransactionKey::for_request(&request).unwrap(),
            request.clone(),
            command_tx,
            ack_rx,
            cancel_rx,
            done_rx,
        );
        (
            IncomingRequest {
                request,
                transaction: Some(transaction),
            },
            InboundSide {
                commands: command_rx,
                _acks: ack_tx,
                _cancels: cancel_tx,
                done: Some(done_tx),
            },
        )
    }

    fn settings(invite_mode: InviteMode) -> ServiceSettings {
        ServiceSettings {
            local_ip: "10.0.0.1".to_string(),
            sip_port: 5060,
            user_agent: "Beowulf".to_string(),
            invite_mode,
            fallback_destination: String::new(),
            max_concurrent_exchanges: 0,
        }
    }

    fn service(
        leg: MockOutboundLeg,
        media: MockMediaGateway,
        invite_mode: InviteMode,
    ) -> (SipService, Arc<InMemoryRegistry>) {
        let registry = Arc::new(InMemoryRegistry::new());
        let service = SipService::new(
            registry.clone(),
            Arc::new(leg),
            Arc::new(media),
            settings(invite_mode),
        );
        (service, registry)
    }

    fn header_value(response: &SipResponse, name: &str) -> Option<String> {
        response
            .headers()
            .iter()
            .map(|h| h.to_string())
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.trim()
                    .eq_ignore_ascii_case(name)
                    .then(|| value.trim().to_string())
            })
    }

    #[tokio::test]
    async fn test_register_updates_registry() {
        let (service, registry) = service(
            MockOutboundLeg::new(),
            MockMediaGateway::new(),
            InviteMode::Answer,
        );
        let (incoming, mut inbound) =
            incoming(request("REGISTER", "Contact: <sip:alice@10.0.0.5:5060>\r\n", ""));

        service.dispatch(incoming).await;

        assert_eq!(inbound.response().await.status_code(), 200);
        assert_eq!(registry.get("alice").await.as_deref(), Some("10.0.0.5:5060"));
    }

    #[tokio::test]
    async fn test_invite_answered_with_sdp() {
        let mut media = MockMediaGateway::new();
        media
            .expect_allocate_listener()
            .times(1)
            .returning(|| Ok(40000));
        media
            .expect_negotiate()
            .withf(|offer, local, port| {
                offer == b"v=0\r\n" && local == "10.0.0.1" && *port == 40000
            })
            .times(1)
            .returning(|_, _, _| Ok(b"v=0\r\nanswer".to_vec()));

        let (service, _) = service(MockOutboundLeg::new(), media, InviteMode::Answer);
        let (incoming, mut inbound) = incoming(request("INVITE", "", "v=0\r\n"));

        service.dispatch(incoming).await;

        let response = inbound.response().await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.body(), b"v=0\r\nanswer");
        assert_eq!(
            header_value(&response, "Content-Type").as_deref(),
            Some("application/sdp")
        );
        let contact = response.contact().unwrap();
        assert_eq!(
            crate::infrastructure::protocols::sip::headers::host_port(&contact.uri.host_with_port),
            "10.0.0.1:5060"
        );
    }

    #[tokio::test]
    async fn test_media_failure_gets_500() {
        let mut media = MockMediaGateway::new();
        media.expect_allocate_listener().returning(|| Ok(40000));
        media
            .expect_negotiate()
            .returning(|_, _, _| Err(MediaError::InvalidOffer("no origin".to_string())));

        let (service, _) = service(MockOutboundLeg::new(), media, InviteMode::Answer);
        let (incoming, mut inbound) = incoming(request("INVITE", "", "garbage"));

        service.dispatch(incoming).await;

        assert_eq!(inbound.response().await.status_code(), 500);
    }

    #[tokio::test]
    async fn test_message_acknowledged_without_routing() {
        let mut leg = MockOutboundLeg::new();
        leg.expect_transaction_request().never();
        leg.expect_write_request().never();

        let (service, _) = service(leg, MockMediaGateway::new(), InviteMode::Answer);
        let (incoming, mut inbound) = incoming(request("MESSAGE", "", "hello"));

        service.dispatch(incoming).await;

        assert_eq!(inbound.response().await.status_code(), 200);
    }

    #[tokio::test]
    async fn test_ack_forwarded_with_via() {
        let mut leg = MockOutboundLeg::new();
        leg.expect_write_request()
            .withf(|request, options| {
                request.destination.as_deref() == Some("10.0.0.5:5060")
                    && *options == ForwardOptions::via_only()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let (service, registry) = service(leg, MockMediaGateway::new(), InviteMode::Answer);
        registry.add("alice", "10.0.0.5:5060").await;

        service
            .dispatch(IncomingRequest {
                request: request("ACK", "", ""),
                transaction: None,
            })
            .await;
    }

    #[tokio::test]
    async fn test_failed_ack_forward_answers_500() {
        let mut leg = MockOutboundLeg::new();
        leg.expect_write_request()
            .times(1)
            .returning(|_, _| Err(SipError::TransportError("unreachable".to_string())));
        leg.expect_write_response()
            .withf(|response| {
                response.status_code() == 500
                    && response.destination.as_deref() == Some("10.0.0.9:5070")
                    && response.cseq_method().as_deref() == Some("ACK")
            })
            .times(1)
            .returning(|_| Ok(()));

        let (service, registry) = service(leg, MockMediaGateway::new(), InviteMode::Answer);
        registry.add("alice", "10.0.0.5:5060").await;

        service
            .dispatch(IncomingRequest {
                request: request("ACK", "", ""),
                transaction: None,
            })
            .await;
    }

    #[tokio::test]
    async fn test_ack_without_destination_dropped() {
        let mut leg = MockOutboundLeg::new();
        leg.expect_write_request().never();

        let (service, _) = service(leg, MockMediaGateway::new(), InviteMode::Answer);
        service
            .dispatch(IncomingRequest {
                request: request("ACK", "", ""),
                transaction: None,
            })
            .await;
    }

    #[tokio::test]
    async fn test_bye_goes_through_relay() {
        let (response_tx, response_rx) = mpsc::channel(4);
        let (control_tx, _control_rx) = mpsc::unbounded_channel();
        let client = ClientTransaction::new(
            TransactionKey::new("z9hG4bKproxy", "BYE"),
            response_rx,
            control_tx,
        );

        let mut leg = MockOutboundLeg::new();
        leg.expect_transaction_request()
            .withf(|request, options| {
                request.destination.as_deref() == Some("10.0.0.5:5060")
                    && *options == ForwardOptions::relay()
            })
            .times(1)
            .return_once(move |_, _| Ok(client));

        let (service, registry) = service(leg, MockMediaGateway::new(), InviteMode::Answer);
        registry.add("alice", "10.0.0.5:5060").await;
        let service = Arc::new(service);

        let (incoming, mut inbound) = incoming(request("BYE", "", ""));
        let task = tokio::spawn({
            let service = service.clone();
            async move { service.dispatch(incoming).await }
        });

        drop(response_tx);
        let _ = inbound.done.take().unwrap().send(Ok(()));
        assert_ok!(tokio::time::timeout(Duration::from_secs(2), task).await);
    }

    #[tokio::test]
    async fn test_relay_mode_routes_invite() {
        let mut media = MockMediaGateway::new();
        media.expect_allocate_listener().never();

        let (service, _) = service(MockOutboundLeg::new(), media, InviteMode::Relay);
        let (incoming, mut inbound) = incoming(request("INVITE", "", ""));

        service.dispatch(incoming).await;

        // Nobody registered and no fallback
        assert_eq!(inbound.response().await.status_code(), 404);
    }
}
