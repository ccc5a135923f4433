//! # Cadence Providers
//!
//! AI decision collaborator for Cadence. Every OpenAI-compatible server is
//! handled by a single [`OpenAiDecider`]; prompt templates live in
//! [`prompts`], never in the engine.

pub mod openai_compatible;
pub mod prompts;

use cadence_core::config::LlmConfig;
use cadence_core::error::Result;
use cadence_core::traits::Decider;

pub use openai_compatible::OpenAiDecider;

/// Create the decider from configuration.
pub fn create_decider(config: &LlmConfig) -> Result<Box<dyn Decider>> {
    if config.api_key.is_empty() {
        tracing::warn!("⚠️ No LLM API key configured; only keyless local endpoints will answer");
    }
    Ok(Box::new(OpenAiDecider::from_config(config)?))
}
