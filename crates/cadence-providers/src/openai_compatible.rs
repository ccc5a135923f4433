//! OpenAI-compatible AI decider.
//!
//! Every decision is one chat completion against `{endpoint}/chat/completions`.
//! Any server speaking that API works (OpenAI, DeepSeek, Groq, Ollama,
//! llama.cpp); the endpoint and key are the only differences.

use async_trait::async_trait;
use cadence_core::config::LlmConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::retry::{Backoff, is_retryable_status};
use cadence_core::traits::Decider;
use cadence_core::types::{
    ContextBundle, MemoryProposal, OutreachProposal, Recipient, ReplyDecision, TaskProposal,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

use crate::prompts;

/// Outcome of one HTTP attempt.
enum Attempt {
    Retry(CadenceError),
    Fatal(CadenceError),
}

/// Decider backed by a chat-completions endpoint.
pub struct OpenAiDecider {
    name: String,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    planning_temperature: f32,
    merge_temperature: f32,
    persona: String,
    backoff: Backoff,
    client: reqwest::Client,
}

impl OpenAiDecider {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| CadenceError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: "openai-compatible".to_string(),
            api_key: config.api_key.clone(),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            planning_temperature: config.planning_temperature,
            merge_temperature: config.merge_temperature,
            persona: config.persona.clone(),
            backoff: Backoff::new(config.max_attempts),
            client,
        })
    }

    /// Override the retry schedule (tests use millisecond delays).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    /// One chat completion, retried on connection errors, 429 and 5xx.
    async fn complete(&self, system: String, user: String, temperature: f32, caller: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        let url = format!("{}/chat/completions", self.base_url);

        let mut attempt = 1;
        loop {
            tracing::debug!("🤖 {caller}: request to {} (attempt {attempt})", self.model);
            match self.attempt(&url, &body).await {
                Ok(text) => {
                    tracing::debug!("🤖 {caller}: {} chars back", text.len());
                    return Ok(text);
                }
                Err(Attempt::Retry(e)) if self.backoff.should_retry(attempt) => {
                    let wait = self.backoff.delay(attempt);
                    tracing::warn!("⚠️ {caller}: {e}; retrying in {}ms", wait.as_millis());
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(Attempt::Retry(e)) | Err(Attempt::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn attempt(&self, url: &str, body: &Value) -> std::result::Result<String, Attempt> {
        let req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        let resp = self.apply_auth(req).send().await.map_err(|e| {
            Attempt::Retry(CadenceError::Http(format!("{} connection failed ({url}): {e}", self.name)))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = CadenceError::Provider(format!("{} API error {status}: {text}", self.name));
            return Err(if is_retryable_status(status.as_u16()) {
                Attempt::Retry(err)
            } else {
                Attempt::Fatal(err)
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| Attempt::Fatal(CadenceError::Http(e.to_string())))?;
        json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Attempt::Fatal(CadenceError::Provider("No choices in response".into())))
    }

    /// Completion parsed as a JSON object.
    async fn complete_json(&self, system: String, user: String, temperature: f32, caller: &str) -> Result<Value> {
        let text = self.complete(system, user, temperature, caller).await?;
        extract_json(&text).ok_or_else(|| {
            CadenceError::Parse(format!("{caller}: no JSON object in response: {}", preview(&text)))
        })
    }

    fn now_line(context: &ContextBundle) -> String {
        format!("{} {}", context.local_date, context.local_time)
    }
}

/// Entries of `value[key]` that deserialize; malformed ones are dropped.
fn entries<T: DeserializeOwned>(value: &Value, key: &str, caller: &str) -> Result<Vec<T>> {
    let list = value
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| CadenceError::Parse(format!("{caller}: missing '{key}' array")))?;
    Ok(list
        .iter()
        .filter_map(|entry| match serde_json::from_value::<T>(entry.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("⚠️ {caller}: dropping malformed entry ({e})");
                None
            }
        })
        .collect())
}

/// Find a JSON object in model output: the whole text, a ```json fence, or
/// the outermost `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Some(v);
    }
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(rest[..end].trim()) {
                return Some(v);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}

#[async_trait]
impl Decider for OpenAiDecider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn propose_daily_tasks(
        &self,
        _recipient: &Recipient,
        context: &ContextBundle,
    ) -> Result<Vec<TaskProposal>> {
        let system = prompts::system_prompt(&self.persona, "You plan your own day.");
        let ctx = prompts::format_context(context);
        let user = prompts::render(
            prompts::DAILY_PLANNING,
            &[("date", context.local_date.as_str()), ("context", ctx.as_str())],
        );
        let value = self
            .complete_json(system, user, self.planning_temperature, "daily planning")
            .await?;
        entries(&value, "tasks", "daily planning")
    }

    async fn propose_outreach_messages(
        &self,
        _recipient: &Recipient,
        context: &ContextBundle,
    ) -> Result<Vec<OutreachProposal>> {
        let system = prompts::system_prompt(&self.persona, "You reach out to the user on your own.");
        let ctx = prompts::format_context(context);
        let user = prompts::render(
            prompts::AUTONOMOUS_OUTREACH,
            &[("date", context.local_date.as_str()), ("context", ctx.as_str())],
        );
        let value = self
            .complete_json(system, user, self.planning_temperature, "outreach")
            .await?;
        entries(&value, "messages", "outreach")
    }

    async fn merge_messages(
        &self,
        _recipient: &Recipient,
        contents: &[String],
        context: &ContextBundle,
    ) -> Result<String> {
        let system = prompts::system_prompt(&self.persona, "You merge pending messages into one.");
        let (now, ctx) = (Self::now_line(context), prompts::format_context(context));
        let pending = prompts::numbered(contents);
        let user = prompts::render(
            prompts::MESSAGE_MERGE,
            &[("now", now.as_str()), ("context", ctx.as_str()), ("messages", pending.as_str())],
        );
        let merged = self
            .complete(system, user, self.merge_temperature, "merge")
            .await?;
        if merged.is_empty() {
            return Err(CadenceError::Provider("merge returned empty text".into()));
        }
        Ok(merged)
    }

    async fn decide_reply(
        &self,
        recipient: &Recipient,
        message: &str,
        context: &ContextBundle,
    ) -> Result<ReplyDecision> {
        let system = prompts::system_prompt(&self.persona, "You decide how and when to reply.");
        let (now, ctx) = (Self::now_line(context), prompts::format_context(context));
        let sender = recipient.to_string();
        let user = prompts::render(
            prompts::REPLY_DECISION,
            &[
                ("now", now.as_str()),
                ("sender", sender.as_str()),
                ("context", ctx.as_str()),
                ("message", message),
            ],
        );
        let value = self
            .complete_json(system, user, self.planning_temperature, "reply decision")
            .await?;
        let mut decision: ReplyDecision = serde_json::from_value(value)?;
        if decision.content.trim().is_empty() {
            return Err(CadenceError::Provider("reply decision has empty content".into()));
        }
        decision.delay_minutes = decision.delay_minutes.max(0);
        Ok(decision)
    }

    async fn detect_memory(
        &self,
        recipient: &Recipient,
        message: &str,
        context: &ContextBundle,
    ) -> Result<Option<MemoryProposal>> {
        let system = prompts::system_prompt(&self.persona, "You decide what is worth remembering.");
        let ctx = prompts::format_context(context);
        let sender = recipient.to_string();
        let user = prompts::render(
            prompts::MEMORY_DETECTION,
            &[("sender", sender.as_str()), ("context", ctx.as_str()), ("message", message)],
        );
        let value = self
            .complete_json(system, user, self.merge_temperature, "memory detection")
            .await?;
        if !value["has_memory"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        let mut proposal: MemoryProposal = serde_json::from_value(value)?;
        if proposal.content.trim().is_empty() {
            proposal.content = message.to_string();
        }
        Ok(Some(proposal))
    }
}
