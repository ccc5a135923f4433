//! Task-level policies shared by the generators and the dispatcher.

use serde::{Deserialize, Serialize};

/// Business-level retry policy for failed sends.
///
/// Distinct from the low-level HTTP retries inside the collaborators: this
/// counts whole dispatch attempts of one reply task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Retry count to re-queue with, or `None` once the ceiling is reached.
    pub fn next_attempt(&self, retry_count: u32) -> Option<u32> {
        (retry_count < self.max_retries).then(|| retry_count + 1)
    }
}

/// The three recurring jobs owned by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DailyPlan,
    Outreach,
    Dispatch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DailyPlan => "daily_plan",
            JobKind::Outreach => "autonomous_outreach",
            JobKind::Dispatch => "dispatch",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_attempt(0), Some(1));
        assert_eq!(policy.next_attempt(2), Some(3));
        assert_eq!(policy.next_attempt(3), None);
        assert_eq!(RetryPolicy::new(0).next_attempt(0), None);
    }

    #[test]
    fn test_job_names() {
        assert_eq!(JobKind::Dispatch.to_string(), "dispatch");
        assert_eq!(JobKind::Outreach.as_str(), "autonomous_outreach");
    }
}
