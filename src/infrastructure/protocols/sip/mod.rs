//! SIP protocol implementation
//!
//! A stateful proxy and registrar on top of an RFC 3261 transaction layer.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Service Layer         │
//! │ (Dispatch, Registrar)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Relay Loop           │
//! │  (Routed exchanges)     │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │        (UDP)            │
//! └─────────────────────────┘
//! ```

pub mod builder;
pub mod endpoint;
pub mod handler;
pub mod headers;
pub mod message;
pub mod registrar;
pub mod router;
pub mod sdp;
pub mod server;
pub mod transaction;
pub mod transport;

pub use endpoint::{Endpoint, ForwardOptions, IncomingRequest, OutboundLeg};
pub use handler::{ServiceSettings, SipService};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registrar::{Registrar, Registration};
pub use router::{RelayEvent, RelayLoop, RelayOutcome, RelayState};
pub use sdp::SdpSession;
pub use server::{SipServer, SipServerConfig};
pub use transaction::{
    ClientTransaction, InviteClientState, InviteServerState, NonInviteClientState,
    NonInviteServerState, ServerTransaction, SipTimers, TimerType, TransactionKey,
    TransactionState,
};
pub use transport::{Transport, TransportProtocol, UdpTransport};
