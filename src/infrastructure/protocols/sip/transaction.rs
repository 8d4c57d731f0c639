//! SIP Transaction Layer
//!
//! Implements client and server transactions as per RFC 3261 Section 17.
//! Every transaction is driven by its own task; the handles given to the
//! transaction user talk to that task over channels.
//!
//! ## Transaction Types
//! - INVITE Client Transaction (ICT) - Section 17.1.1
//! - INVITE Server Transaction (IST) - Section 17.2.1
//! - Non-INVITE Client Transaction (NICT) - Section 17.1.2
//! - Non-INVITE Server Transaction (NIST) - Section 17.2.2

use super::builder::ResponseBuilder;
use super::headers;
use super::message::{SipError, SipRequest, SipResponse};
use super::transport::Transport;
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Version};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const INBOX_CAPACITY: usize = 32;

/// Transaction key - branch of the top Via plus the method (RFC 3261 17.1.3 / 17.2.3)
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: String,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            method: method.into(),
        }
    }

    pub fn for_request(request: &SipRequest) -> Option<Self> {
        Some(Self::new(request.branch()?, request.method_name()))
    }

    pub fn for_response(response: &SipResponse) -> Option<Self> {
        Some(Self::new(response.branch()?, response.cseq_method()?))
    }

    pub fn is_invite(&self) -> bool {
        self.method == "INVITE"
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.method)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl SipTimers {
    pub fn from_millis(t1: u64, t2: u64, t4: u64) -> Self {
        Self {
            t1: Duration::from_millis(t1),
            t2: Duration::from_millis(t2),
            t4: Duration::from_millis(t4),
        }
    }
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer types for SIP transactions over an unreliable transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit interval (T1, doubling)
    TimerA,
    /// Timer B: INVITE transaction timeout (64*T1)
    TimerB,
    /// Timer D: Wait time for response retransmits (64*T1)
    TimerD,
    /// Timer E: Non-INVITE request retransmit (T1, doubling up to T2)
    TimerE,
    /// Timer F: Non-INVITE transaction timeout (64*T1)
    TimerF,
    /// Timer G: INVITE response retransmit (T1, doubling up to T2)
    TimerG,
    /// Timer H: Wait time for ACK receipt (64*T1)
    TimerH,
    /// Timer I: Wait time for ACK retransmits (T4)
    TimerI,
    /// Timer J: Wait time for retransmits of non-INVITE requests (64*T1)
    TimerJ,
    /// Timer K: Wait time for response retransmits (T4)
    TimerK,
}

impl TimerType {
    pub fn duration(&self, timers: &SipTimers) -> Duration {
        match self {
            TimerType::TimerA | TimerType::TimerE | TimerType::TimerG => timers.t1,
            TimerType::TimerI | TimerType::TimerK => timers.t4,
            TimerType::TimerB
            | TimerType::TimerD
            | TimerType::TimerF
            | TimerType::TimerH
            | TimerType::TimerJ => timers.t1 * 64,
        }
    }

    fn deadline(&self, timers: &SipTimers) -> Instant {
        Instant::now() + self.duration(timers)
    }
}

/// INVITE Client Transaction States (RFC 3261 Section 17.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// INVITE Server Transaction States (RFC 3261 Section 17.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Non-INVITE Server Transaction States (RFC 3261 Section 17.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Transaction type and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    InviteClient(InviteClientState),
    InviteServer(InviteServerState),
    NonInviteClient(NonInviteClientState),
    NonInviteServer(NonInviteServerState),
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Terminated)
                | TransactionState::InviteServer(InviteServerState::Terminated)
                | TransactionState::NonInviteClient(NonInviteClientState::Terminated)
                | TransactionState::NonInviteServer(NonInviteServerState::Terminated)
        )
    }

    /// True once a final response has been sent or received
    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Calling)
                | TransactionState::InviteClient(InviteClientState::Proceeding)
                | TransactionState::InviteServer(InviteServerState::Proceeding)
                | TransactionState::NonInviteClient(NonInviteClientState::Trying)
                | TransactionState::NonInviteClient(NonInviteClientState::Proceeding)
                | TransactionState::NonInviteServer(NonInviteServerState::Trying)
                | TransactionState::NonInviteServer(NonInviteServerState::Proceeding)
        )
    }

    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::InviteClient(InviteClientState::Calling) => "ICT-Calling",
            TransactionState::InviteClient(InviteClientState::Proceeding) => "ICT-Proceeding",
            TransactionState::InviteClient(InviteClientState::Completed) => "ICT-Completed",
            TransactionState::InviteClient(InviteClientState::Terminated) => "ICT-Terminated",
            TransactionState::InviteServer(InviteServerState::Proceeding) => "IST-Proceeding",
            TransactionState::InviteServer(InviteServerState::Completed) => "IST-Completed",
            TransactionState::InviteServer(InviteServerState::Confirmed) => "IST-Confirmed",
            TransactionState::InviteServer(InviteServerState::Terminated) => "IST-Terminated",
            TransactionState::NonInviteClient(NonInviteClientState::Trying) => "NICT-Trying",
            TransactionState::NonInviteClient(NonInviteClientState::Proceeding) => {
                "NICT-Proceeding"
            }
            TransactionState::NonInviteClient(NonInviteClientState::Completed) => "NICT-Completed",
            TransactionState::NonInviteClient(NonInviteClientState::Terminated) => {
                "NICT-Terminated"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Trying) => "NIST-Trying",
            TransactionState::NonInviteServer(NonInviteServerState::Proceeding) => {
                "NIST-Proceeding"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Completed) => "NIST-Completed",
            TransactionState::NonInviteServer(NonInviteServerState::Terminated) => {
                "NIST-Terminated"
            }
        }
    }
}

/// Instruction from the transaction user to a server transaction task
#[derive(Debug)]
pub enum ServerCommand {
    /// Send a response within the transaction
    Respond(SipResponse),
    /// Send a response to its destination without touching transaction state
    Stateless(SipResponse),
}

/// Network events the endpoint routes to an existing server transaction
#[derive(Debug)]
pub enum ServerInput {
    Retransmission,
    Ack(SipRequest),
    Cancel(SipRequest),
}

/// Instruction from the transaction user to a client transaction task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientControl {
    Cancel,
    Terminate,
}

/// Handle to an inbound (server) transaction
pub struct ServerTransaction {
    key: TransactionKey,
    request: SipRequest,
    commands: mpsc::Sender<ServerCommand>,
    /// ACKs matching this INVITE transaction
    pub acks: mpsc::Receiver<SipRequest>,
    /// CANCELs matching this INVITE transaction
    pub cancels: mpsc::Receiver<SipRequest>,
    /// Fires once when the transaction terminates, carrying its error if any
    pub done: oneshot::Receiver<Result<(), SipError>>,
}

impl ServerTransaction {
    pub fn new(
        key: TransactionKey,
        request: SipRequest,
        commands: mpsc::Sender<ServerCommand>,
        acks: mpsc::Receiver<SipRequest>,
        cancels: mpsc::Receiver<SipRequest>,
        done: oneshot::Receiver<Result<(), SipError>>,
    ) -> Self {
        Self {
            key,
            request,
            commands,
            acks,
            cancels,
            done,
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    pub async fn respond(&self, response: SipResponse) -> Result<(), SipError> {
        self.command(ServerCommand::Respond(response)).await
    }

    pub async fn respond_stateless(&self, response: SipResponse) -> Result<(), SipError> {
        self.command(ServerCommand::Stateless(response)).await
    }

    async fn command(&self, command: ServerCommand) -> Result<(), SipError> {
        self.commands.send(command).await.map_err(|_| {
            SipError::TransactionError(format!("Transaction {} already terminated", self.key))
        })
    }
}

/// Handle to an outbound (client) transaction
pub struct ClientTransaction {
    key: TransactionKey,
    /// Responses, including a locally generated 408 on timeout
    pub responses: mpsc::Receiver<SipResponse>,
    control: mpsc::UnboundedSender<ClientControl>,
}

impl ClientTransaction {
    pub fn new(
        key: TransactionKey,
        responses: mpsc::Receiver<SipResponse>,
        control: mpsc::UnboundedSender<ClientControl>,
    ) -> Self {
        Self {
            key,
            responses,
            control,
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Ask the transaction to send a CANCEL. Does not wait.
    pub fn cancel(&self) {
        if self.control.send(ClientControl::Cancel).is_err() {
            debug!("Cancel for finished transaction {}", self.key);
        }
    }

    /// Stop the transaction task
    pub fn terminate(&self) {
        let _ = self.control.send(ClientControl::Terminate);
    }
}

/// Shared state of all transactions of one endpoint
pub struct TransactionContext {
    transport: Arc<dyn Transport>,
    timers: SipTimers,
    servers: RwLock<HashMap<TransactionKey, mpsc::Sender<ServerInput>>>,
    clients: RwLock<HashMap<TransactionKey, mpsc::Sender<SipResponse>>>,
}

impl TransactionContext {
    pub fn new(transport: Arc<dyn Transport>, timers: SipTimers) -> Self {
        Self {
            transport,
            timers,
            servers: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn timers(&self) -> SipTimers {
        self.timers
    }

    pub async fn server_count(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Hand an event to a live server transaction. Returns false when none matches.
    pub async fn deliver_to_server(&self, key: &TransactionKey, input: ServerInput) -> bool {
        let inbox = self.servers.read().await.get(key).cloned();
        match inbox {
            Some(inbox) => inbox.send(input).await.is_ok(),
            None => false,
        }
    }

    /// Hand a response to a live client transaction. Returns false when none matches.
    pub async fn deliver_to_client(&self, key: &TransactionKey, response: SipResponse) -> bool {
        let inbox = self.clients.read().await.get(key).cloned();
        match inbox {
            Some(inbox) => inbox.send(response).await.is_ok(),
            None => false,
        }
    }

    async fn send_request(&self, request: &SipRequest, destination: &str) -> Result<(), SipError> {
        self.transport.send(request.to_bytes(), destination).await
    }

    /// Send a response to its destination, falling back to the top Via
    async fn send_response(&self, response: &SipResponse, fallback: Option<&str>) {
        let target = response
            .destination
            .clone()
            .or_else(|| {
                headers::top_typed_via(response.headers()).map(|via| headers::response_target(&via))
            })
            .or_else(|| fallback.map(str::to_string));

        match target {
            Some(target) => {
                if let Err(e) = self.transport.send(response.to_bytes(), &target).await {
                    warn!("Failed to send {} response to {}: {}", response.status_code(), target, e);
                }
            }
            None => warn!("No destination for {} response", response.status_code()),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Create a server transaction for a new request and start its task
pub async fn start_server_transaction(
    ctx: &Arc<TransactionContext>,
    request: SipRequest,
) -> Result<ServerTransaction, SipError> {
    let key = TransactionKey::for_request(&request)
        .ok_or_else(|| SipError::InvalidMessage("Request has no Via branch".to_string()))?;

    let (input_tx, input_rx) = mpsc::channel(INBOX_CAPACITY);
    {
        let mut servers = ctx.servers.write().await;
        if servers.contains_key(&key) {
            return Err(SipError::TransactionError(format!(
                "Transaction {} already exists",
                key
            )));
        }
        servers.insert(key.clone(), input_tx);
    }

    let (command_tx, command_rx) = mpsc::channel(INBOX_CAPACITY);
    let (ack_tx, ack_rx) = mpsc::channel(INBOX_CAPACITY);
    let (cancel_tx, cancel_rx) = mpsc::channel(INBOX_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();

    debug!("Created server transaction {}", key);

    let task = ServerTask {
        ctx: ctx.clone(),
        key: key.clone(),
        request: request.clone(),
        inputs: input_rx,
        commands: command_rx,
        acks: ack_tx,
        cancels: cancel_tx,
        done: done_tx,
    };
    tokio::spawn(task.run());

    Ok(ServerTransaction::new(
        key, request, command_tx, ack_rx, cancel_rx, done_rx,
    ))
}

/// Start a client transaction task without waiting for the first send.
///
/// The returned receiver reports whether the initial request went out.
pub fn spawn_client_transaction(
    ctx: &Arc<TransactionContext>,
    request: SipRequest,
    destination: String,
) -> Result<(ClientTransaction, oneshot::Receiver<Result<(), SipError>>), SipError> {
    let key = TransactionKey::for_request(&request)
        .ok_or_else(|| SipError::InvalidMessage("Request has no Via branch".to_string()))?;

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let (response_tx, response_rx) = mpsc::channel(INBOX_CAPACITY);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (started_tx, started_rx) = oneshot::channel();

    let task = ClientTask {
        ctx: ctx.clone(),
        key: key.clone(),
        request,
        destination,
        inbox_tx,
        inbox: inbox_rx,
        control: control_rx,
        responses: response_tx,
    };
    tokio::spawn(task.run(started_tx));

    Ok((ClientTransaction::new(key, response_rx, control_tx), started_rx))
}

/// Create a client transaction and send its request
pub async fn start_client_transaction(
    ctx: &Arc<TransactionContext>,
    request: SipRequest,
    destination: String,
) -> Result<ClientTransaction, SipError> {
    let (transaction, started) = spawn_client_transaction(ctx, request, destination)?;
    started
        .await
        .map_err(|_| SipError::TransactionError("Client transaction task ended".to_string()))??;
    Ok(transaction)
}

struct ServerTask {
    ctx: Arc<TransactionContext>,
    key: TransactionKey,
    request: SipRequest,
    inputs: mpsc::Receiver<ServerInput>,
    commands: mpsc::Receiver<ServerCommand>,
    acks: mpsc::Sender<SipRequest>,
    cancels: mpsc::Sender<SipRequest>,
    done: oneshot::Sender<Result<(), SipError>>,
}

impl ServerTask {
    async fn run(self) {
        let ServerTask {
            ctx,
            key,
            request,
            mut inputs,
            mut commands,
            acks,
            cancels,
            done,
        } = self;

        let timers = ctx.timers;
        let fallback = request.source.map(|source| headers::format_socket(&source));
        let mut state = if key.is_invite() {
            TransactionState::InviteServer(InviteServerState::Proceeding)
        } else {
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
        };
        let mut last_response: Option<SipResponse> = None;
        let mut retransmit_interval = timers.t1;
        let mut retransmit_at: Option<Instant> = None;
        let mut timeout: Option<(TimerType, Instant)> = None;
        let mut commands_open = true;

        // Proxies answer INVITE with 100 right away (RFC 3261 16.2)
        if key.is_invite() {
            let trying = ResponseBuilder::trying().build_for_request(&request);
            ctx.send_response(&trying, fallback.as_deref()).await;
            last_response = Some(trying);
        }

        let result = loop {
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(ServerCommand::Respond(response)) => {
                        if state.is_final() {
                            debug!("Transaction {} already answered, dropping {}", key, response.status_code());
                            continue;
                        }

                        ctx.send_response(&response, fallback.as_deref()).await;
                        let code = response.status_code();
                        last_response = Some(response);

                        state = match state {
                            TransactionState::InviteServer(_) if code < 200 => {
                                TransactionState::InviteServer(InviteServerState::Proceeding)
                            }
                            TransactionState::InviteServer(_) if code < 300 => {
                                TransactionState::InviteServer(InviteServerState::Terminated)
                            }
                            TransactionState::InviteServer(_) => {
                                retransmit_at = Some(TimerType::TimerG.deadline(&timers));
                                timeout = Some((TimerType::TimerH, TimerType::TimerH.deadline(&timers)));
                                TransactionState::InviteServer(InviteServerState::Completed)
                            }
                            TransactionState::NonInviteServer(_) if code < 200 => {
                                TransactionState::NonInviteServer(NonInviteServerState::Proceeding)
                            }
                            TransactionState::NonInviteServer(_) => {
                                timeout = Some((TimerType::TimerJ, TimerType::TimerJ.deadline(&timers)));
                                TransactionState::NonInviteServer(NonInviteServerState::Completed)
                            }
                            other => other,
                        };
                        debug!("Server transaction {} -> {}", key, state.name());

                        if state.is_terminated() {
                            break Ok(());
                        }
                    }
                    Some(ServerCommand::Stateless(response)) => {
                        ctx.send_response(&response, None).await;
                    }
                    None => {
                        commands_open = false;
                        if !state.is_final() {
                            break Err(SipError::TransactionError(format!(
                                "Transaction {} dropped without a final response",
                                key
                            )));
                        }
                    }
                },
                input = inputs.recv() => match input {
                    Some(ServerInput::Retransmission) => {
                        if let Some(response) = &last_response {
                            debug!("Request retransmission on {}, resending {}", key, response.status_code());
                            ctx.send_response(response, fallback.as_deref()).await;
                        }
                    }
                    Some(ServerInput::Ack(ack)) => {
                        if let Err(e) = acks.try_send(ack) {
                            debug!("ACK on {} not handed up: {}", key, e);
                        }
                        if state == TransactionState::InviteServer(InviteServerState::Completed) {
                            state = TransactionState::InviteServer(InviteServerState::Confirmed);
                            retransmit_at = None;
                            timeout = Some((TimerType::TimerI, TimerType::TimerI.deadline(&timers)));
                        }
                    }
                    Some(ServerInput::Cancel(cancel)) => {
                        if let Err(e) = cancels.try_send(cancel) {
                            debug!("CANCEL on {} not handed up: {}", key, e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = sleep_until_opt(retransmit_at) => {
                    // Timer G
                    if let Some(response) = &last_response {
                        ctx.send_response(response, fallback.as_deref()).await;
                    }
                    retransmit_interval = (retransmit_interval * 2).min(timers.t2);
                    retransmit_at = Some(Instant::now() + retransmit_interval);
                },
                _ = sleep_until_opt(timeout.map(|(_, at)| at)) => {
                    match timeout.map(|(timer, _)| timer) {
                        Some(TimerType::TimerH) => {
                            break Err(SipError::TransactionError(format!(
                                "No ACK received for transaction {}",
                                key
                            )));
                        }
                        _ => break Ok(()),
                    }
                },
            }
        };

        ctx.servers.write().await.remove(&key);
        match &result {
            Ok(()) => debug!("Server transaction {} terminated", key),
            Err(e) => info!("Server transaction {} terminated: {}", key, e),
        }
        let _ = done.send(result);
    }
}

struct ClientTask {
    ctx: Arc<TransactionContext>,
    key: TransactionKey,
    request: SipRequest,
    destination: String,
    inbox_tx: mpsc::Sender<SipResponse>,
    inbox: mpsc::Receiver<SipResponse>,
    control: mpsc::UnboundedReceiver<ClientControl>,
    responses: mpsc::Sender<SipResponse>,
}

impl ClientTask {
    async fn run(self, started: oneshot::Sender<Result<(), SipError>>) {
        let ClientTask {
            ctx,
            key,
            request,
            destination,
            inbox_tx,
            mut inbox,
            mut control,
            responses,
        } = self;

        {
            let mut clients = ctx.clients.write().await;
            if clients.contains_key(&key) {
                let _ = started.send(Err(SipError::TransactionError(format!(
                    "Transaction {} already exists",
                    key
                ))));
                return;
            }
            clients.insert(key.clone(), inbox_tx);
        }

        if let Err(e) = ctx.send_request(&request, &destination).await {
            ctx.clients.write().await.remove(&key);
            let _ = started.send(Err(e));
            return;
        }
        let _ = started.send(Ok(()));
        debug!("Client transaction {} sent to {}", key, destination);

        let timers = ctx.timers;
        let invite = key.is_invite();
        let mut state = if invite {
            TransactionState::InviteClient(InviteClientState::Calling)
        } else {
            TransactionState::NonInviteClient(NonInviteClientState::Trying)
        };
        let mut retransmit_interval = timers.t1;
        let mut retransmit_at = Some(Instant::now() + retransmit_interval);
        let mut timeout = if invite {
            Some((TimerType::TimerB, TimerType::TimerB.deadline(&timers)))
        } else {
            Some((TimerType::TimerF, TimerType::TimerF.deadline(&timers)))
        };
        let mut control_open = true;
        let mut cancel_pending = false;
        let mut cancelled = false;
        let mut ack: Option<SipRequest> = None;

        loop {
            tokio::select! {
                response = inbox.recv() => {
                    let Some(response) = response else { break };
                    let code = response.status_code();

                    match state {
                        TransactionState::InviteClient(
                            InviteClientState::Calling | InviteClientState::Proceeding,
                        ) => {
                            if code < 200 {
                                state = TransactionState::InviteClient(InviteClientState::Proceeding);
                                retransmit_at = None;
                                let _ = responses.send(response).await;
                                if cancel_pending && !cancelled {
                                    send_cancel(&ctx, &request, &destination);
                                    cancelled = true;
                                }
                            } else if code < 300 {
                                // 2xx ACK is end-to-end, nothing left to do here
                                let _ = responses.send(response).await;
                                state = TransactionState::InviteClient(InviteClientState::Terminated);
                                break;
                            } else {
                                let request_ack = build_ack(&request, &response);
                                if let Err(e) = ctx.send_request(&request_ack, &destination).await {
                                    warn!("Failed to send ACK for {}: {}", key, e);
                                }
                                ack = Some(request_ack);
                                let _ = responses.send(response).await;
                                state = TransactionState::InviteClient(InviteClientState::Completed);
                                retransmit_at = None;
                                timeout = Some((TimerType::TimerD, TimerType::TimerD.deadline(&timers)));
                            }
                        }
                        TransactionState::InviteClient(InviteClientState::Completed) => {
                            if let Some(ack) = ack.as_ref().filter(|_| code >= 300) {
                                let _ = ctx.send_request(ack, &destination).await;
                            }
                        }
                        TransactionState::NonInviteClient(
                            NonInviteClientState::Trying | NonInviteClientState::Proceeding,
                        ) => {
                            let _ = responses.send(response).await;
                            if code < 200 {
                                state = TransactionState::NonInviteClient(NonInviteClientState::Proceeding);
                                retransmit_interval = timers.t2;
                            } else {
                                state = TransactionState::NonInviteClient(NonInviteClientState::Completed);
                                retransmit_at = None;
                                timeout = Some((TimerType::TimerK, TimerType::TimerK.deadline(&timers)));
                            }
                        }
                        _ => debug!("Absorbed {} on {} in {}", code, key, state.name()),
                    }
                }
                command = control.recv(), if control_open => match command {
                    Some(ClientControl::Cancel) => {
                        if !invite || cancelled {
                            continue;
                        }
                        match state {
                            TransactionState::InviteClient(InviteClientState::Proceeding) => {
                                send_cancel(&ctx, &request, &destination);
                                cancelled = true;
                            }
                            // CANCEL waits for a provisional response (RFC 3261 9.1)
                            TransactionState::InviteClient(InviteClientState::Calling) => {
                                cancel_pending = true;
                            }
                            _ => {}
                        }
                    }
                    Some(ClientControl::Terminate) => break,
                    None => control_open = false,
                },
                _ = sleep_until_opt(retransmit_at) => {
                    // Timer A / Timer E
                    if let Err(e) = ctx.send_request(&request, &destination).await {
                        warn!("Failed to retransmit {}: {}", key, e);
                    }
                    retransmit_interval = if invite {
                        retransmit_interval * 2
                    } else {
                        (retransmit_interval * 2).min(timers.t2)
                    };
                    retransmit_at = Some(Instant::now() + retransmit_interval);
                },
                _ = sleep_until_opt(timeout.map(|(_, at)| at)) => {
                    if let Some((TimerType::TimerB | TimerType::TimerF, _)) = timeout {
                        warn!("Client transaction {} timed out towards {}", key, destination);
                        let timed_out = ResponseBuilder::request_timeout()
                            .build_headers_from(request.headers());
                        let _ = responses.send(timed_out).await;
                    }
                    break;
                },
            }
        }

        ctx.clients.write().await.remove(&key);
        debug!("Client transaction {} terminated in {}", key, state.name());
    }
}

fn send_cancel(ctx: &Arc<TransactionContext>, request: &SipRequest, destination: &str) {
    let cancel = build_cancel(request);
    match spawn_client_transaction(ctx, cancel, destination.to_string()) {
        Ok(_) => info!("Sent CANCEL to {}", destination),
        Err(e) => warn!("Failed to send CANCEL to {}: {}", destination, e),
    }
}

/// Request sharing the top Via, Call-ID, From and Route of `request` (RFC 3261 9.1 / 17.1.1.3)
fn build_companion(request: &SipRequest, method: Method, to: Option<Header>) -> SipRequest {
    let mut list = Vec::new();

    if let Some(via) = headers::top_via(request.headers()) {
        list.push(Header::Via(rsip::headers::Via::new(via)));
    }
    list.push(Header::MaxForwards(rsip::headers::MaxForwards::new(
        headers::DEFAULT_MAX_FORWARDS.to_string(),
    )));

    for header in request.headers().iter() {
        match header {
            Header::Route(_) | Header::From(_) | Header::CallId(_) => list.push(header.clone()),
            Header::To(_) if to.is_none() => list.push(header.clone()),
            _ => {}
        }
    }
    if let Some(to) = to {
        list.push(to);
    }

    let cseq = request.cseq().unwrap_or(1);
    list.push(Header::CSeq(rsip::headers::CSeq::new(format!(
        "{} {}",
        cseq, method
    ))));
    list.push(Header::ContentLength("0".into()));

    let mut companion = SipRequest::new(Request {
        method,
        uri: request.uri().clone(),
        version: Version::V2,
        headers: Headers::from(list),
        body: Vec::new(),
    });
    companion.destination = request.destination.clone();
    companion
}

fn build_ack(request: &SipRequest, response: &SipResponse) -> SipRequest {
    let to = response
        .headers()
        .iter()
        .find(|h| matches!(h, Header::To(_)))
        .cloned();
    build_companion(request, Method::Ack, to)
}

fn build_cancel(request: &SipRequest) -> SipRequest {
    build_companion(request, Method::Cancel, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    /// Transport that records everything it is asked to send
    struct RecordingTransport {
        sent: mpsc::UnboundedSender<(String, String)>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, data: Bytes, destination: &str) -> Result<(), SipError> {
            let text = String::from_utf8_lossy(&data).to_string();
            let _ = self.sent.send((text, destination.to_string()));
            Ok(())
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:5060".parse().unwrap()
        }

        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Udp
        }
    }

    struct FailingTransport {
        attempts: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl Transport for FailingTransport {
        async fn send(&self, _data: Bytes, destination: &str) -> Result<(), SipError> {
            *self.attempts.lock().unwrap() += 1;
            Err(SipError::TransportError(format!("unreachable {}", destination)))
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:5060".parse().unwrap()
        }

        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Udp
        }
    }

    fn context(
        timers: SipTimers,
    ) -> (Arc<TransactionContext>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RecordingTransport { sent: tx });
        (Arc::new(TransactionContext::new(transport, timers)), rx)
    }

    fn request(method: &str, branch: &str) -> SipRequest {
        let data = format!(
            "{method} sip:bob@10.0.0.7:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch={branch}\r\n\
             Max-Forwards: 69\r\n\
             From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
             To: Bob <sip:bob@example.com>\r\n\
             Call-ID: txn-test@10.0.0.5\r\n\
             CSeq: 7 {method}\r\n\
             Content-Length: 0\r\n\r\n"
        );
        SipRequest::parse(data.as_bytes())
            .unwrap()
            .with_source("10.0.0.5:5062".parse().unwrap())
    }

    fn response(code: u16, method: &str, branch: &str) -> SipResponse {
        let data = format!(
            "SIP/2.0 {code} Whatever\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch={branch}\r\n\
             From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
             To: Bob <sip:bob@example.com>;tag=b0b\r\n\
             Call-ID: txn-test@10.0.0.5\r\n\
             CSeq: 7 {method}\r\n\
             Content-Length: 0\r\n\r\n"
        );
        SipResponse::parse(data.as_bytes()).unwrap()
    }

    async fn next_sent(rx: &mut mpsc::UnboundedReceiver<(String, String)>) -> (String, String) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("nothing sent")
            .expect("transport closed")
    }

    #[test]
    fn test_timer_durations() {
        let timers = SipTimers::default();
        assert_eq!(TimerType::TimerB.duration(&timers), Duration::from_secs(32));
        assert_eq!(TimerType::TimerK.duration(&timers), Duration::from_secs(5));
        assert_eq!(TimerType::TimerE.duration(&timers), Duration::from_millis(500));
    }

    #[test]
    fn test_key_for_response_uses_cseq_method() {
        let key = TransactionKey::for_response(&response(200, "CANCEL", "z9hG4bKx")).unwrap();
        assert_eq!(key, TransactionKey::new("z9hG4bKx", "CANCEL"));
        assert!(!key.is_invite());
    }

    #[tokio::test]
    async fn test_non_invite_server_retransmits_final_response() {
        let (ctx, mut sent) = context(SipTimers::from_millis(5, 40, 10));
        let mut server = start_server_transaction(&ctx, request("BYE", "z9hG4bKbye"))
            .await
            .unwrap();

        let ok = ResponseBuilder::ok().build_for_request(server.request());
        server.respond(ok).await.unwrap();

        let (text, destination) = next_sent(&mut sent).await;
        assert!(text.starts_with("SIP/2.0 200"));
        assert_eq!(destination, "10.0.0.5:5062");

        let key = server.key().clone();
        assert!(ctx.deliver_to_server(&key, ServerInput::Retransmission).await);
        let (text, _) = next_sent(&mut sent).await;
        assert!(text.starts_with("SIP/2.0 200"));

        // Timer J ends the transaction cleanly
        let result = tokio::time::timeout(Duration::from_secs(2), &mut server.done)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(ctx.server_count().await, 0);
    }

    #[tokio::test]
    async fn test_invite_server_sends_trying_and_absorbs_ack() {
        let (ctx, mut sent) = context(SipTimers::from_millis(20, 40, 10));
        let mut server = start_server_transaction(&ctx, request("INVITE", "z9hG4bKinv"))
            .await
            .unwrap();

        let (text, _) = next_sent(&mut sent).await;
        assert!(text.starts_with("SIP/2.0 100"));

        let busy = ResponseBuilder::new(486).build_for_request(server.request());
        server.respond(busy).await.unwrap();
        let (text, _) = next_sent(&mut sent).await;
        assert!(text.starts_with("SIP/2.0 486"));

        // Timer G fires before the ACK arrives
        let (text, _) = next_sent(&mut sent).await;
        assert!(text.starts_with("SIP/2.0 486"));

        let key = server.key().clone();
        assert!(ctx.deliver_to_server(&key, ServerInput::Ack(request("ACK", "z9hG4bKinv"))).await);

        let ack = tokio::time::timeout(Duration::from_secs(2), server.acks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.method_name(), "ACK");

        let result = tokio::time::timeout(Duration::from_secs(2), &mut server.done)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unread_acks_overflow_without_stalling() {
        let (ctx, _sent) = context(SipTimers::from_millis(20, 40, 200));
        let mut server = start_server_transaction(&ctx, request("INVITE", "z9hG4bKflood"))
            .await
            .unwrap();

        let busy = ResponseBuilder::new(486).build_for_request(server.request());
        server.respond(busy).await.unwrap();

        // Nobody reads the ACKs, so the ones past the channel capacity are dropped
        let key = server.key().clone();
        for _ in 0..INBOX_CAPACITY + 4 {
            ctx.deliver_to_server(&key, ServerInput::Ack(request("ACK", "z9hG4bKflood")))
                .await;
        }

        let result = tokio::time::timeout(Duration::from_secs(2), &mut server.done)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        let mut delivered = 0;
        while server.acks.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, INBOX_CAPACITY);
    }

    #[tokio::test]
    async fn test_invite_server_without_ack_fails_on_timer_h() {
        let (ctx, _sent) = context(SipTimers::from_millis(2, 4, 5));
        let mut server = start_server_transaction(&ctx, request("INVITE", "z9hG4bKnoack"))
            .await
            .unwrap();

        let busy = ResponseBuilder::new(486).build_for_request(server.request());
        server.respond(busy).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), &mut server.done)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SipError::TransactionError(_))));
    }

    #[tokio::test]
    async fn test_duplicate_server_transaction_rejected() {
        let (ctx, _sent) = context(SipTimers::default());
        let _first = start_server_transaction(&ctx, request("MESSAGE", "z9hG4bKdup"))
            .await
            .unwrap();
        let second = start_server_transaction(&ctx, request("MESSAGE", "z9hG4bKdup")).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_client_timeout_delivers_408() {
        let (ctx, mut sent) = context(SipTimers::from_millis(5, 20, 10));
        let mut request = request("OPTIONS", "z9hG4bKopt");
        request.set_destination("10.0.0.7:5060");

        let mut client = start_client_transaction(&ctx, request, "10.0.0.7:5060".to_string())
            .await
            .unwrap();

        let (text, destination) = next_sent(&mut sent).await;
        assert!(text.starts_with("OPTIONS"));
        assert_eq!(destination, "10.0.0.7:5060");

        // Timer E retransmission
        let (text, _) = next_sent(&mut sent).await;
        assert!(text.starts_with("OPTIONS"));

        let timed_out = tokio::time::timeout(Duration::from_secs(2), client.responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(timed_out.status_code(), 408);
        assert_eq!(timed_out.branch().as_deref(), Some("z9hG4bKopt"));

        assert!(client.responses.recv().await.is_none());
        assert_eq!(ctx.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_invite_client_acks_error_response() {
        let (ctx, mut sent) = context(SipTimers::from_millis(100, 400, 100));
        let mut client = start_client_transaction(
            &ctx,
            request("INVITE", "z9hG4bKcall"),
            "10.0.0.7:5060".to_string(),
        )
        .await
        .unwrap();
        let _ = next_sent(&mut sent).await;

        let key = client.key().clone();
        assert!(ctx.deliver_to_client(&key, response(486, "INVITE", "z9hG4bKcall")).await);

        let (ack, destination) = next_sent(&mut sent).await;
        assert!(ack.starts_with("ACK sip:bob@10.0.0.7:5060"));
        assert!(ack.contains("CSeq: 7 ACK"));
        assert!(ack.contains("tag=b0b"));
        assert_eq!(destination, "10.0.0.7:5060");

        let forwarded = client.responses.recv().await.unwrap();
        assert_eq!(forwarded.status_code(), 486);
        client.terminate();
    }

    #[tokio::test]
    async fn test_cancel_waits_for_provisional() {
        let (ctx, mut sent) = context(SipTimers::from_millis(100, 400, 100));
        let mut client = start_client_transaction(
            &ctx,
            request("INVITE", "z9hG4bKring"),
            "10.0.0.7:5060".to_string(),
        )
        .await
        .unwrap();
        let _ = next_sent(&mut sent).await;

        client.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sent.try_recv().is_err());

        let key = client.key().clone();
        ctx.deliver_to_client(&key, response(180, "INVITE", "z9hG4bKring")).await;
        assert_eq!(client.responses.recv().await.unwrap().status_code(), 180);

        let (cancel, _) = next_sent(&mut sent).await;
        assert!(cancel.starts_with("CANCEL sip:bob@10.0.0.7:5060"));
        assert!(cancel.contains("branch=z9hG4bKring"));
        assert!(cancel.contains("CSeq: 7 CANCEL"));
        client.terminate();
    }

    #[tokio::test]
    async fn test_client_send_failure_is_reported() {
        let transport = Arc::new(FailingTransport {
            attempts: Mutex::new(0),
        });
        let ctx = Arc::new(TransactionContext::new(transport.clone(), SipTimers::default()));

        let result = start_client_transaction(
            &ctx,
            request("BYE", "z9hG4bKfail"),
            "10.0.0.7:5060".to_string(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(*transport.attempts.lock().unwrap(), 1);
        assert_eq!(ctx.client_count().await, 0);
    }
}
