//! # Cadence
//!
//! Scheduled task engine: daily planning, proactive outreach and claim-safe
//! message dispatch.
//!
//! Usage:
//!   cadence run                                   # Start the scheduler (Ctrl-C to stop)
//!   cadence plan --recipient 3                    # Plan one recipient's day now
//!   cadence dispatch                              # Run one dispatcher tick
//!   cadence recipient add --external-id 42        # Register a chat user
//!   cadence message --recipient 3 --text "hi"     # Feed an incoming message

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use cadence_core::CadenceConfig;
use cadence_core::traits::{Decider, TaskStore, Transport};
use cadence_core::types::{NewRecipient, Recipient, ReplyStatus, ReplyUpdate};
use cadence_scheduler::Engine;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "⏰ Cadence — daily planning, proactive outreach and message dispatch"
)]
struct Cli {
    /// Config file (default: ~/.cadence/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler runtime and wait for Ctrl-C
    Run,
    /// Run the daily planner now
    Plan {
        #[arg(long)]
        recipient: Option<i64>,
    },
    /// Run autonomous outreach now
    Outreach {
        #[arg(long)]
        recipient: Option<i64>,
    },
    /// Run one dispatcher tick
    Dispatch,
    /// Show store statistics and configuration
    Status,
    /// Manage recipients
    Recipient {
        #[command(subcommand)]
        action: RecipientAction,
    },
    /// Feed an incoming message through intake
    Message {
        #[arg(long)]
        recipient: i64,
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "user")]
        sender: String,
    },
    /// Cancel a pending reply task
    Cancel { id: i64 },
}

#[derive(Subcommand)]
enum RecipientAction {
    Add {
        #[arg(long)]
        external_id: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    List,
    Disable { id: i64 },
    Enable { id: i64 },
}

fn load_config(path: Option<&PathBuf>) -> Result<CadenceConfig> {
    let config = match path {
        Some(p) => {
            let expanded = PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).to_string());
            CadenceConfig::load_from(&expanded)
                .with_context(|| format!("loading {}", expanded.display()))?
        }
        None => CadenceConfig::load()?,
    };
    Ok(config)
}

async fn open_store(config: &CadenceConfig) -> Result<Arc<dyn TaskStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = config.database.url.as_deref().filter(|u| !u.is_empty()) {
        let store = cadence_scheduler::PgStore::connect(url).await?;
        return Ok(Arc::new(store));
    }
    #[cfg(not(feature = "postgres"))]
    if config.database.url.as_deref().is_some_and(|u| !u.is_empty()) {
        tracing::warn!("⚠️ database.url is set but this build has no postgres support; using SQLite");
    }

    let path = config.database.expanded_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(cadence_scheduler::SqliteStore::from_config(&config.database)?))
}

async fn recipient(store: &Arc<dyn TaskStore>, id: i64) -> Result<Recipient> {
    match store.get_recipient(id).await? {
        Some(r) => Ok(r),
        None => bail!("recipient #{id} not found"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "info,cadence=debug,cadence_scheduler=debug,cadence_providers=debug,cadence_channels=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref())?;
    let store = open_store(&config).await?;

    // Store-only commands.
    match &cli.command {
        Command::Recipient { action } => return recipient_command(&store, action).await,
        Command::Cancel { id } => {
            let changed = store
                .transition_reply_task(*id, ReplyStatus::Pending, &ReplyUpdate::to(ReplyStatus::Cancelled))
                .await?;
            if changed {
                println!("🛑 Reply task #{id} cancelled");
            } else {
                println!("⚠️  Reply task #{id} is not pending; nothing cancelled");
            }
            return Ok(());
        }
        Command::Status => return status(&store, &config).await,
        _ => {}
    }

    let decider: Arc<dyn Decider> = Arc::from(cadence_providers::create_decider(&config.llm)?);
    let transport: Arc<dyn Transport> =
        Arc::new(cadence_channels::WebhookTransport::from_config(&config.transport)?);
    let engine = Engine::new(config, store.clone(), decider, transport)?;
    let now = Utc::now();

    match cli.command {
        Command::Run => {
            let runtime = engine.runtime()?;
            println!("⏰ Cadence v{}", env!("CARGO_PKG_VERSION"));
            for (kind, trigger) in runtime.jobs() {
                println!("   {kind}: {trigger}");
            }
            runtime.start();
            tokio::signal::ctrl_c().await?;
            println!("\n⏹️  Shutting down...");
            runtime.stop().await;
        }
        Command::Plan { recipient: Some(id) } => {
            let r = recipient(&store, id).await?;
            let (created, skipped) = engine.planner.plan_for(&r, now).await?;
            println!("📅 {r}: {created} planned task(s), {skipped} skipped");
        }
        Command::Plan { recipient: None } => {
            println!("📅 {}", engine.planner.run(now).await?);
        }
        Command::Outreach { recipient: Some(id) } => {
            let r = recipient(&store, id).await?;
            let (created, skipped) = engine.outreach.outreach_for(&r, now).await?;
            println!("💌 {r}: {created} outreach message(s) queued, {skipped} skipped");
        }
        Command::Outreach { recipient: None } => {
            println!("💌 {}", engine.outreach.run(now).await?);
        }
        Command::Dispatch => {
            println!("📤 {}", engine.dispatcher.tick(now).await?);
        }
        Command::Message { recipient: id, text, sender } => {
            let r = recipient(&store, id).await?;
            let raw = serde_json::json!({ "source": "cli" });
            let outcome = engine.intake.handle(&r, &sender, &text, raw, now).await?;
            println!(
                "💬 Reply task #{} at {}: {}",
                outcome.reply_task.id, outcome.reply_task.scheduled_time, outcome.reply_task.content
            );
            for shift in &outcome.shifted {
                println!("   ↪ task #{} moved {} → {}", shift.task_id, shift.from, shift.to);
            }
            if let Some(memory) = outcome.memory {
                println!("   🧠 memory '{}' (strength {})", memory.title, memory.strength);
            }
        }
        Command::Recipient { .. } | Command::Cancel { .. } | Command::Status => {}
    }
    Ok(())
}

async fn recipient_command(store: &Arc<dyn TaskStore>, action: &RecipientAction) -> Result<()> {
    match action {
        RecipientAction::Add { external_id, name } => {
            let r = store
                .upsert_recipient(&NewRecipient {
                    external_id: external_id.clone(),
                    display_name: name.clone(),
                })
                .await?;
            println!("✅ Recipient #{} ({})", r.id, r.external_id);
        }
        RecipientAction::List => {
            let all = store.list_recipients().await?;
            if all.is_empty() {
                println!("No recipients.");
            }
            for r in all {
                let state = if r.is_active { "active" } else { "disabled" };
                println!("#{:<4} {:<16} {:<20} {state}", r.id, r.external_id, r.display_name);
            }
        }
        RecipientAction::Disable { id } | RecipientAction::Enable { id } => {
            let active = matches!(action, RecipientAction::Enable { .. });
            if !store.set_recipient_active(*id, active).await? {
                bail!("recipient #{id} not found");
            }
            println!("✅ Recipient #{id} {}", if active { "enabled" } else { "disabled" });
        }
    }
    Ok(())
}

async fn status(store: &Arc<dyn TaskStore>, config: &CadenceConfig) -> Result<()> {
    let stats = store.stats().await?;
    println!("⏰ Cadence v{} ({} store)", env!("CARGO_PKG_VERSION"), store.name());
    println!(
        "   Recipients: {} ({} active)",
        stats.recipients, stats.active_recipients
    );
    println!("   Planned tasks: {:?}", stats.planned_by_status);
    println!("   Reply tasks:   {:?}", stats.reply_by_status);
    println!("   Memories: {}  Messages: {}", stats.memories, stats.messages);
    println!();
    println!("   Plan cron:      {}", config.schedule.plan_cron);
    println!("   Outreach cron:  {}", config.schedule.outreach_cron);
    println!("   Dispatch every: {}s (batch {})", config.schedule.dispatch_interval_secs, config.dispatch.batch_limit);
    println!("   UTC offset:     {} min", config.schedule.utc_offset_minutes);
    println!("   LLM:            {} @ {}", config.llm.model, config.llm.endpoint);
    println!(
        "   Webhook:        {}",
        if config.transport.webhook_url.is_empty() { "not configured" } else { "configured" }
    );
    Ok(())
}
