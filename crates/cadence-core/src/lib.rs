//! # Cadence Core
//!
//! Shared vocabulary for the Cadence task engine: domain types, the
//! storage/AI/transport collaborator traits, configuration and errors.

pub mod clock;
pub mod config;
pub mod error;
pub mod retry;
pub mod traits;
pub mod types;

pub use clock::LocalClock;
pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
