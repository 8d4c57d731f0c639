//! Relay loop for routed requests
//!
//! One exchange runs per inbound request:
//! `Resolving -> Dispatched -> Relaying -> Terminated`.
//! While relaying, four event sources are multiplexed: responses from the
//! outbound transaction, plus ACKs, CANCELs and the completion signal of
//! the inbound transaction.

use super::builder::ResponseBuilder;
use super::endpoint::{ForwardOptions, OutboundLeg};
use super::headers;
use super::message::{SipError, SipRequest, SipResponse};
use super::transaction::{ClientTransaction, ServerTransaction};
use crate::domain::routing::DestinationResolver;
use metrics::counter;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Something that happened on one of the two legs
#[derive(Debug)]
pub enum RelayEvent {
    /// Response from the outbound transaction; `None` once its stream closed
    Response(Option<SipResponse>),
    Ack(SipRequest),
    Cancel(SipRequest),
    /// The inbound transaction finished, possibly with an error
    Done(Result<(), SipError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Resolving,
    Dispatched,
    Relaying,
    Terminated,
}

/// How an exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    ProtocolError,
    Unresolvable,
    TooManyHops,
    DispatchFailed,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::ProtocolError => "protocol_error",
            RelayOutcome::Unresolvable => "unresolvable",
            RelayOutcome::TooManyHops => "too_many_hops",
            RelayOutcome::DispatchFailed => "dispatch_failed",
        }
    }
}

/// Terminates the outbound transaction when the exchange is left, on any path
struct OutboundGuard(ClientTransaction);

impl Deref for OutboundGuard {
    type Target = ClientTransaction;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for OutboundGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Drop for OutboundGuard {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// State of one exchange while relaying
struct Exchange {
    request: SipRequest,
    destination: String,
    responses_open: bool,
}

pub struct RelayLoop {
    leg: Arc<dyn OutboundLeg>,
    resolver: DestinationResolver,
    limiter: Option<Arc<Semaphore>>,
}

impl RelayLoop {
    /// `max_concurrent` of 0 leaves the number of exchanges unbounded.
    pub fn new(
        leg: Arc<dyn OutboundLeg>,
        resolver: DestinationResolver,
        max_concurrent: usize,
    ) -> Self {
        Self {
            leg,
            resolver,
            limiter: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    pub fn leg(&self) -> &Arc<dyn OutboundLeg> {
        &self.leg
    }

    pub fn resolver(&self) -> &DestinationResolver {
        &self.resolver
    }

    /// Relay `request` until its inbound transaction is done
    pub async fn run(&self, request: SipRequest, inbound: ServerTransaction) -> RelayOutcome {
        // Waiting for a permit is the backpressure for bounded deployments
        let _permit = match &self.limiter {
            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
            None => None,
        };

        let outcome = self.relay(request, inbound).await;
        counter!("sip_relay_exchanges_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn relay(&self, request: SipRequest, mut inbound: ServerTransaction) -> RelayOutcome {
        debug!(
            method = %request.method_name(),
            call_id = ?request.call_id(),
            "Relay {:?}",
            RelayState::Resolving
        );

        if request.max_forwards() == Some(0) {
            reply(&inbound, &request, ResponseBuilder::too_many_hops()).await;
            return RelayOutcome::TooManyHops;
        }

        let Some(destination) = self.resolver.resolve_request(&request).await else {
            info!(
                "No destination for {} to {:?}",
                request.method_name(),
                request.to_user()
            );
            reply(&inbound, &request, ResponseBuilder::not_found()).await;
            return RelayOutcome::Unresolvable;
        };

        debug!(destination = %destination, "Relay {:?}", RelayState::Dispatched);

        let mut outbound_request = request.clone();
        outbound_request.set_destination(destination.clone());
        let mut outbound = match self
            .leg
            .transaction_request(outbound_request, ForwardOptions::relay())
            .await
        {
            Ok(transaction) => OutboundGuard(transaction),
            Err(e) => {
                error!(
                    "Failed to open {} transaction to {}: {}",
                    request.method_name(),
                    destination,
                    e
                );
                reply(&inbound, &request, ResponseBuilder::server_internal_error()).await;
                return RelayOutcome::DispatchFailed;
            }
        };

        info!(
            method = %request.method_name(),
            destination = %destination,
            "Relay {:?}",
            RelayState::Relaying
        );

        let mut exchange = Exchange {
            request,
            destination,
            responses_open: true,
        };

        let outcome = loop {
            let event = next_event(&mut inbound, &mut outbound, exchange.responses_open).await;
            if let Some(outcome) = self.handle(&mut exchange, &inbound, &outbound, event).await {
                break outcome;
            }
        };

        debug!(
            destination = %exchange.destination,
            outcome = outcome.as_str(),
            "Relay {:?}",
            RelayState::Terminated
        );
        outcome
    }

    /// Transition function of the `Relaying` state; `Some` leaves the loop
    async fn handle(
        &self,
        exchange: &mut Exchange,
        inbound: &ServerTransaction,
        outbound: &ClientTransaction,
        event: RelayEvent,
    ) -> Option<RelayOutcome> {
        match event {
            RelayEvent::Response(Some(mut response)) => {
                if let Some(source) = exchange.request.source {
                    response.set_destination(headers::format_socket(&source));
                }
                headers::remove_top_via(response.headers_mut());

                debug!(
                    "Forwarding {} from {}",
                    response.status_code(),
                    exchange.destination
                );
                if let Err(e) = inbound.respond(response).await {
                    debug!("Response not forwarded: {}", e);
                }
                None
            }
            RelayEvent::Response(None) => {
                debug!("Outbound transaction to {} closed", exchange.destination);
                exchange.responses_open = false;
                None
            }
            RelayEvent::Ack(mut ack) => {
                ack.set_destination(exchange.destination.clone());
                if let Err(e) = self.leg.write_request(ack, ForwardOptions::default()).await {
                    warn!("Failed to forward ACK to {}: {}", exchange.destination, e);
                }
                None
            }
            RelayEvent::Cancel(cancel) => {
                let ok = ResponseBuilder::ok().build_for_request(&cancel);
                if let Err(e) = inbound.respond_stateless(ok).await {
                    warn!("Failed to answer CANCEL: {}", e);
                }
                outbound.cancel();
                None
            }
            RelayEvent::Done(Ok(())) => Some(RelayOutcome::Completed),
            RelayEvent::Done(Err(e)) => {
                error!(
                    "SIP protocol error on {} to {}: {}",
                    exchange.request.method_name(),
                    exchange.destination,
                    e
                );
                Some(RelayOutcome::ProtocolError)
            }
        }
    }
}

/// Wait for whichever source is ready first
async fn next_event(
    inbound: &mut ServerTransaction,
    outbound: &mut ClientTransaction,
    responses_open: bool,
) -> RelayEvent {
    tokio::select! {
        response = outbound.responses.recv(), if responses_open => RelayEvent::Response(response),
        Some(ack) = inbound.acks.recv() => RelayEvent::Ack(ack),
        Some(cancel) = inbound.cancels.recv() => RelayEvent::Cancel(cancel),
        result = &mut inbound.done => RelayEvent::Done(result.unwrap_or_else(|_| {
            Err(SipError::TransactionError("Inbound transaction vanished".to_string()))
        })),
    }
}

async fn reply(inbound: &ServerTransaction, request: &SipRequest, builder: ResponseBuilder) {
    let response = builder.build_for_request(request);
    let code = response.status_code();
    if let Err(e) = inbound.respond(response).await {
        warn!("Failed to send {} for {}: {}", code, request.method_name(), e);
    }
}
