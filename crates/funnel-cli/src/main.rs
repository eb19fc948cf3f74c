//! funnelsync binary
//!
//! Drives the sync engine against a local SQLite "remote".
//!
//! ## Usage
//!
//! ```bash
//! # Create the schema (or an out-of-date one, to watch drift handling)
//! funnelsync --db demo.db init
//! funnelsync --db demo.db init --legacy
//!
//! # Scripted edit session; --outage drops the first N store calls
//! funnelsync --db demo.db demo --outage 12
//!
//! # Inspect
//! funnelsync --db demo.db show <FUNNEL_ID>
//! funnelsync --config sync.ron queue
//! ```

mod faults;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use funnel_doc::{DocumentStore, StepPatch};
use funnel_store::{
    Filter, Order, QueueJournal, Record, RemoteStore, SqliteJournal, SqliteStore, collections,
};
use funnel_sync::{SyncConfig, SyncEngine, SyncError, SyncEvent, SyncListener};
use funnel_types::{CanvasElement, FunnelId};

use crate::faults::Flaky;

/// A `steps` table from before `backButtonText` was added.
const LEGACY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS funnels (
    id TEXT PRIMARY KEY, name TEXT NOT NULL DEFAULT '', description TEXT,
    status TEXT NOT NULL DEFAULT 'draft', settings TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER
);
CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY, funnel_id TEXT NOT NULL, order_index INTEGER NOT NULL DEFAULT 0,
    title TEXT NOT NULL DEFAULT '', buttonText TEXT, showProgressBar INTEGER,
    canvasElements TEXT NOT NULL DEFAULT '[]', updated_at INTEGER
);
CREATE TABLE IF NOT EXISTS canvas_elements (
    id TEXT PRIMARY KEY, step_id TEXT NOT NULL, type TEXT NOT NULL DEFAULT '',
    position INTEGER NOT NULL DEFAULT 0, config TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER
);
"#;

/// Local-first sync engine demo and inspection tool.
#[derive(Parser, Debug)]
#[command(name = "funnelsync")]
#[command(about = "Local-first funnel sync engine over a SQLite store")]
struct Args {
    /// SQLite database acting as the remote store
    #[arg(long, default_value = "funnelsync.db")]
    db: PathBuf,

    /// RON sync configuration (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store schema
    Init {
        /// Create a stale schema lacking steps.backButtonText
        #[arg(long)]
        legacy: bool,
    },
    /// Run a scripted edit session and print sync events
    Demo {
        /// Fail this many store calls before the remote "comes back"
        #[arg(long, default_value_t = 0)]
        outage: usize,

        /// Number of rapid element reorders
        #[arg(long, default_value_t = 5)]
        reorders: usize,

        /// Seconds to wait for the retry queue to drain
        #[arg(long, default_value_t = 60)]
        drain_secs: u64,
    },
    /// Dump a persisted funnel and its steps
    Show {
        funnel: String,
    },
    /// List operations in the queue journal
    Queue {
        /// Journal path (overrides the config's journal_path)
        #[arg(long)]
        journal: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::default(),
    };

    match args.command {
        Command::Init { legacy } => init(&args.db, legacy),
        Command::Demo {
            outage,
            reorders,
            drain_secs,
        } => {
            let store = SqliteStore::open(&args.db)
                .with_context(|| format!("opening {}", args.db.display()))?;
            let store: Arc<dyn RemoteStore> = if outage > 0 {
                Arc::new(Flaky::new(store, outage))
            } else {
                Arc::new(store)
            };
            demo(store, config, reorders, Duration::from_secs(drain_secs)).await?;
            Ok(())
        }
        Command::Show { funnel } => show(&args.db, &funnel).await,
        Command::Queue { journal } => {
            let Some(path) = journal.or(config.journal_path) else {
                bail!("no journal configured; pass --journal or set journal_path");
            };
            list_queue(&path)
        }
    }
}

fn init(db: &Path, legacy: bool) -> Result<()> {
    if legacy {
        SqliteStore::open_with_schema(db, LEGACY_SCHEMA)?;
    } else {
        SqliteStore::open(db)?;
    }
    info!("initialized {} ({} schema)", db.display(), if legacy { "legacy" } else { "current" });
    Ok(())
}

/// Prints engine notifications as they arrive.
struct EventPrinter;

impl SyncListener for EventPrinter {
    fn on_persisted(&mut self, aggregate_id: FunnelId, record: &Record) {
        let updated = record.get("updated_at").cloned().unwrap_or_default();
        println!("persisted  {} (updated_at {updated})", aggregate_id.short());
    }

    fn on_persist_failed(&mut self, aggregate_id: FunnelId, error: &SyncError) {
        println!("FAILED     {} [{}] {error}", aggregate_id.short(), error.class());
    }

    fn on_event(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::Queued {
                aggregate_id,
                revision,
                ..
            } => println!("queued     {} r{revision}", aggregate_id.short()),
            SyncEvent::RetryScheduled {
                aggregate_id,
                attempts_made,
                delay,
                ..
            } => println!(
                "retrying   {} after attempt {attempts_made}, next in {delay:?}",
                aggregate_id.short()
            ),
            SyncEvent::Persisted { tier, .. } => print!("[{tier}] "),
            SyncEvent::PersistFailed { .. } => {}
        }
    }
}

async fn demo(
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
    reorders: usize,
    drain: Duration,
) -> Result<FunnelId> {
    let window = config.debounce_window();
    let docs = DocumentStore::shared();
    let engine = SyncEngine::spawn(store, docs.clone(), config)?;
    let printer = engine.listen(EventPrinter);

    let id = docs.create("Spring webinar");
    let (register, thanks) =
        docs.update(id, |doc| Ok((doc.add_step("Register"), doc.add_step("Thank you"))))?;
    let mut blocks = Vec::new();
    for kind in ["headline", "video", "form", "countdown"] {
        blocks.push(docs.update(id, |doc| doc.add_element(register, CanvasElement::new(kind)))?);
        engine.schedule_save(id);
    }
    println!("created    {} with {} blocks", id.short(), blocks.len());
    // During an outage this lands in the retry queue; the drain below waits for it.
    if let Err(err) = engine.flush_now(id).await {
        println!("flush_now: {err}");
    }

    // Drag-and-drop burst: coalesces into one write.
    for i in 0..reorders {
        let block = blocks[i % blocks.len()];
        docs.update(id, |doc| doc.move_element(register, block, 0))?;
        engine.schedule_save(id);
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    tokio::time::sleep(window * 2).await;

    docs.update(id, |doc| {
        doc.update_step(
            thanks,
            StepPatch {
                back_button_text: Some("Go back".into()),
                ..StepPatch::default()
            },
        )
    })?;
    docs.update(id, |doc| doc.update_step(register, StepPatch::title("Save your seat")))?;
    if let Err(err) = engine.flush_now(id).await {
        println!("flush_now: {err}");
    }

    let deadline = tokio::time::Instant::now() + drain;
    loop {
        let queued = engine.queue_snapshot().await?;
        if queued.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            println!("{} operation(s) still queued", queued.len());
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let rejected = engine.drift().rejected(collections::STEPS);
    if !rejected.is_empty() {
        println!("stripped   steps columns: {}", rejected.join(", "));
    }
    println!("funnel     {id}");
    engine.shutdown().await?;
    printer.abort();
    Ok(id)
}

async fn show(db: &Path, funnel: &str) -> Result<()> {
    let id = FunnelId::parse(funnel).with_context(|| format!("bad funnel id {funnel}"))?;
    let store = SqliteStore::open(db)?;
    let rows = store
        .select_records(collections::FUNNELS, &Filter::eq("id", id.to_string()), None)
        .await?;
    let Some(mut row) = rows.into_iter().next() else {
        bail!("funnel {id} not found in {}", db.display());
    };
    let steps = store
        .select_records(
            collections::STEPS,
            &Filter::eq("funnel_id", id.to_string()),
            Some(&Order::asc("order_index")),
        )
        .await?;
    row.insert(
        "steps".into(),
        serde_json::Value::Array(steps.into_iter().map(serde_json::Value::Object).collect()),
    );
    println!("{}", serde_json::to_string_pretty(&row)?);
    Ok(())
}

fn list_queue(path: &Path) -> Result<()> {
    let journal = SqliteJournal::open(path)?;
    let entries = journal.load_all()?;
    if entries.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    println!("{:<38} {:<10} {:>8}  description", "operation", "funnel", "attempts");
    for entry in entries {
        let funnel = FunnelId::parse(&entry.aggregate_id)
            .map(|id| id.short())
            .unwrap_or(entry.aggregate_id);
        println!(
            "{:<38} {:<10} {:>4}/{:<3}  {}",
            entry.id, funnel, entry.attempts_made, entry.max_attempts, entry.description
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.queue.jitter = 0.0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_survives_outage_and_drains_queue() {
        // Both same-tier attempts of the first aggregate save fail.
        let flaky = Arc::new(Flaky::new(SqliteStore::in_memory().unwrap(), 2));
        let store: Arc<dyn RemoteStore> = flaky.clone();

        let id = demo(store, quiet_config(), 2, Duration::from_secs(60))
            .await
            .unwrap();

        let funnel = flaky
            .select_records(collections::FUNNELS, &Filter::eq("id", id.to_string()), None)
            .await
            .unwrap();
        assert_eq!(funnel.len(), 1);
        assert_eq!(funnel[0]["name"], "Spring webinar");

        let steps = flaky
            .select_records(
                collections::STEPS,
                &Filter::eq("funnel_id", id.to_string()),
                Some(&Order::asc("order_index")),
            )
            .await
            .unwrap();
        let titles: Vec<_> = steps.iter().map(|row| row["title"].clone()).collect();
        assert_eq!(titles, vec!["Save your seat", "Thank you"]);
    }
}
