//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }

    /// Environment overrides for secrets and endpoints.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CADENCE_DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Ok(url) = std::env::var("CADENCE_WEBHOOK_URL") {
            self.transport.webhook_url = url;
        }
        if let Ok(token) = std::env::var("CADENCE_WEBHOOK_TOKEN") {
            self.transport.token = token;
        }
        if self.llm.api_key.is_empty() {
            self.llm.api_key = ["CADENCE_LLM_API_KEY", "OPENAI_API_KEY"]
                .iter()
                .find_map(|key| std::env::var(key).ok())
                .unwrap_or_default();
        }
        if let Ok(endpoint) = std::env::var("CADENCE_LLM_ENDPOINT") {
            self.llm.endpoint = endpoint;
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, expr) in [
            ("schedule.plan_cron", &self.schedule.plan_cron),
            ("schedule.outreach_cron", &self.schedule.outreach_cron),
        ] {
            if !is_valid_cron(expr) {
                return Err(CadenceError::Config(format!(
                    "{name}: invalid cron expression '{expr}' (need MIN HOUR DOM MON DOW)"
                )));
            }
        }
        if self.schedule.dispatch_interval_secs == 0 {
            return Err(CadenceError::Config(
                "schedule.dispatch_interval_secs must be > 0".into(),
            ));
        }
        if self.dispatch.batch_limit == 0 {
            return Err(CadenceError::Config("dispatch.batch_limit must be > 0".into()));
        }
        if self.schedule.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(CadenceError::Config(format!(
                "schedule.utc_offset_minutes out of range: {}",
                self.schedule.utc_offset_minutes
            )));
        }
        Ok(())
    }
}

/// Shape check for a 5-field cron expression; field semantics are checked by
/// the scheduler's cron evaluator.
fn is_valid_cron(expr: &str) -> bool {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    parts.len() == 5
        && parts.iter().all(|p| {
            p.chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | '/' | ',' | '-'))
        })
}

fn bool_true() -> bool { true }

/// Durable storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path (`~` is expanded).
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
    /// Postgres URL; takes precedence over `path` when built with `postgres`.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_db_path() -> String { "~/.cadence/cadence.db".into() }
fn default_busy_timeout() -> u64 { 5000 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
            url: None,
        }
    }
}

impl DatabaseConfig {
    pub fn expanded_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Trigger cadence. Cron expressions are evaluated in `utc_offset_minutes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_plan_cron")]
    pub plan_cron: String,
    #[serde(default = "default_outreach_cron")]
    pub outreach_cron: String,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_plan_cron() -> String { "0 0 * * *".into() }
fn default_outreach_cron() -> String { "5 0 * * *".into() }
fn default_dispatch_interval() -> u64 { 60 }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            plan_cron: default_plan_cron(),
            outreach_cron: default_outreach_cron(),
            dispatch_interval_secs: default_dispatch_interval(),
            utc_offset_minutes: 0,
        }
    }
}

/// Dispatcher limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Max tasks claimed per tick.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Business-level send retries per task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_batch_limit() -> usize { 20 }
fn default_max_retries() -> u32 { 3 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            max_retries: default_max_retries(),
        }
    }
}

/// Conflict avoidance between user replies and autonomous messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    #[serde(default = "default_window")]
    pub window_minutes: i64,
    #[serde(default = "default_shift")]
    pub shift_minutes: i64,
}

fn default_window() -> i64 { 15 }
fn default_shift() -> i64 { 30 }

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_window(),
            shift_minutes: default_shift(),
        }
    }
}

/// Context bundle sizes and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_context_limit")]
    pub limit: usize,
    #[serde(default = "default_reply_limit")]
    pub reply_limit: usize,
    #[serde(default = "default_planning_weight")]
    pub planning_min_weight: f64,
    #[serde(default = "default_outreach_weight")]
    pub outreach_min_weight: f64,
    #[serde(default = "default_recent_days")]
    pub recent_message_days: i64,
}

fn default_context_limit() -> usize { 20 }
fn default_reply_limit() -> usize { 10 }
fn default_planning_weight() -> f64 { 5.0 }
fn default_outreach_weight() -> f64 { 3.0 }
fn default_recent_days() -> i64 { 3 }

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            limit: default_context_limit(),
            reply_limit: default_reply_limit(),
            planning_min_weight: default_planning_weight(),
            outreach_min_weight: default_outreach_weight(),
            recent_message_days: default_recent_days(),
        }
    }
}

/// AI collaborator (OpenAI-compatible endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Attempts per request on connection errors, 429 and 5xx.
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_creative_temperature")]
    pub planning_temperature: f32,
    #[serde(default = "default_merge_temperature")]
    pub merge_temperature: f32,
    /// Persona prepended to every system prompt.
    #[serde(default)]
    pub persona: String,
}

fn default_llm_endpoint() -> String { "https://api.openai.com/v1".into() }
fn default_model() -> String { "gpt-4o-mini".into() }
fn default_llm_timeout() -> u64 { 60 }
fn default_attempts() -> u32 { 3 }
fn default_max_tokens() -> u32 { 1024 }
fn default_creative_temperature() -> f32 { 0.8 }
fn default_merge_temperature() -> f32 { 0.7 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: String::new(),
            model: default_model(),
            timeout_secs: default_llm_timeout(),
            max_attempts: default_attempts(),
            max_tokens: default_max_tokens(),
            planning_temperature: default_creative_temperature(),
            merge_temperature: default_merge_temperature(),
            persona: String::new(),
        }
    }
}

/// Outbound webhook transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Incoming-webhook URL; empty disables sending.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub token: String,
    /// Used when a message has no explicit recipient address.
    #[serde(default)]
    pub default_user_ids: Vec<i64>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_transport_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "bool_true")]
    pub require_success_flag: bool,
}

fn default_connect_timeout() -> u64 { 10 }
fn default_transport_timeout() -> u64 { 30 }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            token: String::new(),
            default_user_ids: vec![],
            connect_timeout_secs: default_connect_timeout(),
            timeout_secs: default_transport_timeout(),
            max_attempts: default_attempts(),
            require_success_flag: true,
        }
    }
}
