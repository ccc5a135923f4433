//! Scheduler Runtime — owns the recurring triggers.
//!
//! Each job runs on its own tokio task: cron jobs sleep until the next
//! matching minute, interval jobs tick with `MissedTickBehavior::Skip`.
//! `start` is idempotent and `stop` is safe to call when not running.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cron::{self, CronSchedule};
use crate::tasks::JobKind;

/// Async job body. Called once per firing.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// When a job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// 5-field cron expression, evaluated at a fixed UTC offset.
    Cron { expression: String, offset: FixedOffset },
    Interval(Duration),
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Cron { expression, offset } => write!(f, "cron '{expression}' ({offset})"),
            Trigger::Interval(every) => write!(f, "every {}s", every.as_secs()),
        }
    }
}

pub struct Job {
    pub kind: JobKind,
    pub trigger: Trigger,
    pub run: JobFn,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// The process-wide trigger owner. Construct once and share by reference.
pub struct SchedulerRuntime {
    jobs: Vec<Job>,
    state: Mutex<Option<Running>>,
}

impl SchedulerRuntime {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            state: Mutex::new(None),
        }
    }

    /// Install every trigger. A second call while running only warns.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.is_some() {
            tracing::warn!("⚠️ Scheduler runtime already running; start ignored");
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let handles = self
            .jobs
            .iter()
            .map(|job| {
                tracing::info!("⏰ Trigger installed: {} ({})", job.kind, job.trigger);
                tokio::spawn(run_job(
                    job.kind,
                    job.trigger.clone(),
                    job.run.clone(),
                    rx.clone(),
                ))
            })
            .collect();
        *state = Some(Running { shutdown, handles });
        tracing::info!("⏰ Scheduler runtime started with {} trigger(s)", self.jobs.len());
    }

    /// Cancel every trigger and wait for in-flight job bodies to finish.
    pub async fn stop(&self) {
        let running = match self.state.lock() {
            Ok(mut state) => state.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(running) = running else {
            tracing::debug!("Scheduler runtime not running; stop ignored");
            return;
        };
        let _ = running.shutdown.send(true);
        for handle in running.handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Trigger task ended abnormally: {e}");
            }
        }
        tracing::info!("⏹️ Scheduler runtime stopped");
    }

    pub fn is_running(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Number of live triggers.
    pub fn trigger_count(&self) -> usize {
        let count = |state: &Option<Running>| state.as_ref().map_or(0, |r| r.handles.len());
        match self.state.lock() {
            Ok(state) => count(&state),
            Err(poisoned) => count(&poisoned.into_inner()),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = (JobKind, &Trigger)> {
        self.jobs.iter().map(|j| (j.kind, &j.trigger))
    }
}

async fn run_job(kind: JobKind, trigger: Trigger, run: JobFn, mut shutdown: watch::Receiver<bool>) {
    match trigger {
        Trigger::Interval(every) => {
            let start = tokio::time::Instant::now() + every;
            let mut interval = tokio::time::interval_at(start, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => run().await,
                    _ = shutdown.changed() => break,
                }
            }
        }
        Trigger::Cron { expression, offset } => {
            let Some(schedule) = CronSchedule::parse(&expression) else {
                tracing::error!("❌ {kind}: invalid cron expression '{expression}', trigger disabled");
                return;
            };
            loop {
                let now = Utc::now();
                let Some(next) = schedule.next_after(now, offset) else {
                    tracing::error!("❌ {kind}: cron '{expression}' never fires, trigger disabled");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tracing::debug!("{kind}: next run at {next}");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        tracing::info!("🔔 {kind} triggered");
                        run().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
}

/// Validate that a cron expression will schedule.
pub fn cron_trigger(expression: &str, offset: FixedOffset) -> Option<Trigger> {
    cron::is_valid(expression).then(|| Trigger::Cron {
        expression: expression.to_string(),
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(kind: JobKind, trigger: Trigger, counter: Arc<AtomicUsize>) -> Job {
        Job {
            kind,
            trigger,
            run: Arc::new(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn three_jobs(counter: Arc<AtomicUsize>) -> Vec<Job> {
        vec![
            counting_job(JobKind::DailyPlan, cron_trigger("0 0 * * *", utc()).unwrap(), counter.clone()),
            counting_job(JobKind::Outreach, cron_trigger("5 0 * * *", utc()).unwrap(), counter.clone()),
            counting_job(JobKind::Dispatch, Trigger::Interval(Duration::from_secs(60)), counter),
        ]
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let runtime = SchedulerRuntime::new(three_jobs(Arc::new(AtomicUsize::new(0))));
        assert_eq!(runtime.trigger_count(), 0);
        for _ in 0..3 {
            runtime.start();
        }
        assert!(runtime.is_running());
        assert_eq!(runtime.trigger_count(), 3);

        runtime.stop().await;
        assert!(!runtime.is_running());
        assert_eq!(runtime.trigger_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let runtime = SchedulerRuntime::new(three_jobs(Arc::new(AtomicUsize::new(0))));
        runtime.stop().await;
        runtime.stop().await;
        assert!(!runtime.is_running());

        runtime.start();
        runtime.stop().await;
        runtime.start();
        assert_eq!(runtime.trigger_count(), 3);
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_job_fires_each_period() {
        let counter = Arc::new(AtomicUsize::new(0));
        let runtime = SchedulerRuntime::new(vec![counting_job(
            JobKind::Dispatch,
            Trigger::Interval(Duration::from_secs(60)),
            counter.clone(),
        )]);
        runtime.start();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(155)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        runtime.stop().await;
    }

    #[test]
    fn test_cron_trigger_rejects_bad_expression() {
        assert!(cron_trigger("0 25 * * *", utc()).is_none());
        assert!(cron_trigger("*/5 * * * *", utc()).is_some());
    }
}
