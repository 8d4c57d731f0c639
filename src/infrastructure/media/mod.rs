//! Media handling for locally answered sessions

pub mod gateway;

pub use gateway::{MediaError, MediaGateway, RtpGateway};
