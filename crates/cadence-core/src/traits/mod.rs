//! Collaborator seams: durable storage, AI decisions and message transport.

pub mod decider;
pub mod store;
pub mod transport;

pub use decider::Decider;
pub use store::TaskStore;
pub use transport::Transport;
