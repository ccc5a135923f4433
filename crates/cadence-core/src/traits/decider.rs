//! AI decision collaborator.
//!
//! Implementations own prompt construction and model selection; callers only
//! hand over structured context.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    ContextBundle, MemoryProposal, OutreachProposal, Recipient, ReplyDecision, TaskProposal,
};

#[async_trait]
pub trait Decider: Send + Sync {
    /// Collaborator name, for logs.
    fn name(&self) -> &str;

    /// Plan the recipient's day.
    async fn propose_daily_tasks(
        &self,
        recipient: &Recipient,
        context: &ContextBundle,
    ) -> Result<Vec<TaskProposal>>;

    /// Proactive messages to send over the day.
    async fn propose_outreach_messages(
        &self,
        recipient: &Recipient,
        context: &ContextBundle,
    ) -> Result<Vec<OutreachProposal>>;

    /// Fold several pending contents into one coherent message.
    async fn merge_messages(
        &self,
        recipient: &Recipient,
        contents: &[String],
        context: &ContextBundle,
    ) -> Result<String>;

    /// Reply text and delay for an incoming message.
    async fn decide_reply(
        &self,
        recipient: &Recipient,
        message: &str,
        context: &ContextBundle,
    ) -> Result<ReplyDecision>;

    /// Memory point worth keeping from an incoming message, if any.
    async fn detect_memory(
        &self,
        recipient: &Recipient,
        message: &str,
        context: &ContextBundle,
    ) -> Result<Option<MemoryProposal>>;
}
