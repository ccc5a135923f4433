//! # Cadence Channels
//! Outbound message transports.

pub mod webhook;

pub use webhook::WebhookTransport;
