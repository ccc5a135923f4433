//! In-crate fakes for the AI and transport collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{Decider, TaskStore, Transport};
use cadence_core::types::{
    ContextBundle, MemoryProposal, NewRecipient, OutreachProposal, Recipient, RecipientId,
    ReplyDecision, TaskProposal,
};

use crate::persistence::SqliteStore;

/// Scripted decider. Unscripted recipients get empty proposals.
#[derive(Default)]
pub struct FakeDecider {
    pub daily: Mutex<HashMap<RecipientId, Vec<TaskProposal>>>,
    pub outreach: Mutex<HashMap<RecipientId, Vec<OutreachProposal>>>,
    pub failing: Mutex<HashSet<RecipientId>>,
    pub merge_fails: Mutex<bool>,
    pub merge_calls: AtomicUsize,
    pub merge_inputs: Mutex<Vec<Vec<String>>>,
    pub reply: Mutex<Option<ReplyDecision>>,
    pub memory: Mutex<Option<MemoryProposal>>,
}

impl FakeDecider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plan(&self, recipient: RecipientId, entries: &[(&str, &str)]) {
        let proposals = entries
            .iter()
            .map(|(title, time)| TaskProposal {
                title: title.to_string(),
                description: String::new(),
                category: "daily".into(),
                time: time.to_string(),
            })
            .collect();
        self.daily.lock().unwrap().insert(recipient, proposals);
    }

    pub fn outreach_for(&self, recipient: RecipientId, entries: &[(&str, &str)]) {
        let proposals = entries
            .iter()
            .map(|(content, time)| OutreachProposal {
                content: content.to_string(),
                time: time.to_string(),
            })
            .collect();
        self.outreach.lock().unwrap().insert(recipient, proposals);
    }

    pub fn fail_for(&self, recipient: RecipientId) {
        self.failing.lock().unwrap().insert(recipient);
    }

    fn check(&self, recipient: &Recipient) -> Result<()> {
        if self.failing.lock().unwrap().contains(&recipient.id) {
            return Err(CadenceError::Provider(format!("scripted failure for {}", recipient.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Decider for FakeDecider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn propose_daily_tasks(
        &self,
        recipient: &Recipient,
        _ctx: &ContextBundle,
    ) -> Result<Vec<TaskProposal>> {
        self.check(recipient)?;
        Ok(self.daily.lock().unwrap().get(&recipient.id).cloned().unwrap_or_default())
    }

    async fn propose_outreach_messages(
        &self,
        recipient: &Recipient,
        _ctx: &ContextBundle,
    ) -> Result<Vec<OutreachProposal>> {
        self.check(recipient)?;
        Ok(self.outreach.lock().unwrap().get(&recipient.id).cloned().unwrap_or_default())
    }

    async fn merge_messages(
        &self,
        _recipient: &Recipient,
        contents: &[String],
        _ctx: &ContextBundle,
    ) -> Result<String> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        self.merge_inputs.lock().unwrap().push(contents.to_vec());
        if *self.merge_fails.lock().unwrap() {
            return Err(CadenceError::Provider("merge unavailable".into()));
        }
        Ok(format!("merged: {}", contents.join(" | ")))
    }

    async fn decide_reply(
        &self,
        recipient: &Recipient,
        _message: &str,
        _ctx: &ContextBundle,
    ) -> Result<ReplyDecision> {
        self.check(recipient)?;
        Ok(self.reply.lock().unwrap().clone().unwrap_or(ReplyDecision {
            content: "got it".into(),
            delay_minutes: 0,
        }))
    }

    async fn detect_memory(
        &self,
        _recipient: &Recipient,
        _message: &str,
        _ctx: &ContextBundle,
    ) -> Result<Option<MemoryProposal>> {
        Ok(self.memory.lock().unwrap().clone())
    }
}

/// Recording transport. Addresses are the recipient's external id.
pub struct FakeTransport {
    pub enabled: bool,
    /// Remaining sends that fail before sends start succeeding.
    pub failures_left: AtomicUsize,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            enabled: true,
            failures_left: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            enabled: false,
            failures_left: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            enabled: true,
            failures_left: AtomicUsize::new(times),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn resolve_address(&self, recipient: &Recipient) -> Result<String> {
        if recipient.external_id.is_empty() || recipient.external_id.starts_with("unknown") {
            return Err(CadenceError::NotFound(format!("no address for {recipient}")));
        }
        Ok(recipient.external_id.clone())
    }

    async fn send(&self, content: &str, address: &str) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(CadenceError::Transport("scripted send failure".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((content.to_string(), address.to_string()));
        Ok(())
    }
}

pub fn memory_store() -> Arc<dyn TaskStore> {
    Arc::new(SqliteStore::in_memory().unwrap())
}

pub async fn add_recipient(store: &Arc<dyn TaskStore>, external_id: &str) -> Recipient {
    store
        .upsert_recipient(&NewRecipient {
            external_id: external_id.into(),
            display_name: format!("user-{external_id}"),
        })
        .await
        .unwrap()
}
