//! Engine — wires the store and collaborators into the generators, the
//! dispatcher and message intake, and builds the runtime's three jobs.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::clock::LocalClock;
use cadence_core::config::CadenceConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{Decider, TaskStore, Transport};
use chrono::Utc;
use futures::FutureExt;

use crate::conflict::ConflictResolver;
use crate::context::ContextBuilder;
use crate::dispatch::Dispatcher;
use crate::generators::{AutonomousOutreach, DailyPlanner};
use crate::intake::MessageIntake;
use crate::runtime::{Job, SchedulerRuntime, Trigger, cron_trigger};
use crate::tasks::{JobKind, RetryPolicy};

/// All engine components, sharing one store.
pub struct Engine {
    pub store: Arc<dyn TaskStore>,
    pub planner: Arc<DailyPlanner>,
    pub outreach: Arc<AutonomousOutreach>,
    pub dispatcher: Arc<Dispatcher>,
    pub intake: Arc<MessageIntake>,
    pub clock: LocalClock,
    config: CadenceConfig,
}

impl Engine {
    pub fn new(
        config: CadenceConfig,
        store: Arc<dyn TaskStore>,
        decider: Arc<dyn Decider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let clock = LocalClock::new(config.schedule.utc_offset_minutes)?;
        let context = ContextBuilder::new(store.clone(), clock, config.context.clone());

        let planner = DailyPlanner::new(store.clone(), decider.clone(), context.clone(), clock);
        let outreach = AutonomousOutreach::new(store.clone(), decider.clone(), context.clone(), clock);
        let dispatcher = Dispatcher::new(
            store.clone(),
            decider.clone(),
            transport.clone(),
            context.clone(),
            config.dispatch.batch_limit,
            RetryPolicy::new(config.dispatch.max_retries),
        );
        let resolver = ConflictResolver::new(store.clone(), &config.conflict);
        let intake = MessageIntake::new(store.clone(), decider, context, resolver);

        tracing::debug!(
            "Engine wired: store={}, transport={} (enabled={})",
            store.name(),
            transport.name(),
            transport.enabled()
        );
        Ok(Self {
            store,
            planner: Arc::new(planner),
            outreach: Arc::new(outreach),
            dispatcher: Arc::new(dispatcher),
            intake: Arc::new(intake),
            clock,
            config,
        })
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    /// Runtime with the daily planner, outreach and dispatcher triggers.
    pub fn runtime(&self) -> Result<SchedulerRuntime> {
        let schedule = &self.config.schedule;
        let offset = self.clock.offset();
        let cron = |expr: &str| {
            cron_trigger(expr, offset)
                .ok_or_else(|| CadenceError::Config(format!("invalid cron expression '{expr}'")))
        };

        let planner = self.planner.clone();
        let plan_job = Job {
            kind: JobKind::DailyPlan,
            trigger: cron(&schedule.plan_cron)?,
            run: Arc::new(move || {
                let planner = planner.clone();
                async move {
                    if let Err(e) = planner.run(Utc::now()).await {
                        tracing::error!("❌ Daily planning aborted: {e}");
                    }
                }
                .boxed()
            }),
        };

        let outreach = self.outreach.clone();
        let outreach_job = Job {
            kind: JobKind::Outreach,
            trigger: cron(&schedule.outreach_cron)?,
            run: Arc::new(move || {
                let outreach = outreach.clone();
                async move {
                    if let Err(e) = outreach.run(Utc::now()).await {
                        tracing::error!("❌ Autonomous outreach aborted: {e}");
                    }
                }
                .boxed()
            }),
        };

        let dispatcher = self.dispatcher.clone();
        let dispatch_job = Job {
            kind: JobKind::Dispatch,
            trigger: Trigger::Interval(Duration::from_secs(schedule.dispatch_interval_secs)),
            run: Arc::new(move || {
                let dispatcher = dispatcher.clone();
                async move {
                    if let Err(e) = dispatcher.tick(Utc::now()).await {
                        tracing::error!("❌ Dispatch tick failed to claim: {e}");
                    }
                }
                .boxed()
            }),
        };

        Ok(SchedulerRuntime::new(vec![plan_job, outreach_job, dispatch_job]))
    }
}
