//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP transport, transactions, relay)
//! - Media gateway (SDP answers, RTP listeners)

pub mod media;
pub mod protocols;
