//! Beowulf - a stateful SIP proxy and registrar built with Rust
//!
//! Clients REGISTER their address, requests addressed to a registered user
//! are relayed to it, and INVITEs can be answered locally with a receive-only
//! audio session.

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use crate::config::{Config, ConfigError, InviteMode};
pub use crate::infrastructure::protocols::sip::{SipError, SipServer, SipService};
