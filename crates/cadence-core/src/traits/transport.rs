//! Message transport collaborator.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Recipient;

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// False when the transport is not configured; nothing can be sent.
    fn enabled(&self) -> bool;

    /// External address for a recipient. An error here is permanent.
    fn resolve_address(&self, recipient: &Recipient) -> Result<String>;

    /// Deliver `content` to `address`.
    async fn send(&self, content: &str, address: &str) -> Result<()>;
}
