//! # Harvest: batch ingestion runner
//!
//! Usage:
//!   harvest run                      # One lock-guarded run (cron-friendly)
//!   harvest run --wait               # Wait for the lock instead of skipping
//!   harvest watch --now              # Recurring runs on `schedule.cron`
//!   harvest seed --items items.txt   # Replace the roster, reset the cursor
//!   harvest status                   # Cursor, pending items, lock holder
//!   harvest init                     # Write a default config
//!
//! Exit codes: 0 success or no work, 1 error, 2 lock busy, 3 cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_collectors::HttpJsonProcessor;
use harvest_core::config::{HarvestConfig, LockMode};
use harvest_core::types::WorkItem;
use chrono::Utc;
use harvest_scheduler::{
    BatchSource, ExclusiveRunLock, JobRunner, current_holder, notifier_from_config, open_store,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harvest", version, about = "🌾 Harvest: lock-guarded, rate-limited batch ingestion")]
struct Cli {
    /// Config file (default: ~/.harvest/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the job once
    Run {
        /// Wait for a running instance to finish instead of skipping
        #[arg(long)]
        wait: bool,
        /// Print the run summary as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Run the job on its cron schedule until interrupted
    Watch {
        /// Start with a run instead of waiting for the first tick
        #[arg(long)]
        now: bool,
    },
    /// Replace the roster from a newline-delimited file
    Seed {
        #[arg(long)]
        items: PathBuf,
    },
    /// Show batch progress and lock holder
    Status,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "harvest=debug,harvest_scheduler=debug,harvest_collectors=debug,harvest_core=debug"
    } else {
        "harvest=info,harvest_scheduler=info,harvest_collectors=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
        .unwrap_or_else(HarvestConfig::default_path);

    let code = match cli.command {
        Command::Init { force } => init(&config_path, force)?,
        command => {
            let config = load_config(&config_path)?;
            match command {
                Command::Run { wait, json } => run(config, wait, json).await?,
                Command::Watch { now } => watch(config, now).await?,
                Command::Seed { items } => seed(&config, &items).await?,
                Command::Status => status(&config)?,
                Command::Init { .. } => 0,
            }
        }
    };
    std::process::exit(code)
}

fn load_config(path: &Path) -> Result<HarvestConfig> {
    if path.exists() {
        HarvestConfig::load_from(path).with_context(|| format!("loading {}", path.display()))
    } else {
        tracing::debug!("no config at {}, using defaults", path.display());
        Ok(HarvestConfig::default())
    }
}

/// Cancel the returned token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

fn build_runner(config: &HarvestConfig) -> Result<JobRunner> {
    let store = open_store(config)?;
    let notifier = notifier_from_config(&config.report, &config.job);
    Ok(JobRunner::from_config(config, store, notifier)?)
}

async fn run(mut config: HarvestConfig, wait: bool, json: bool) -> Result<i32> {
    if wait {
        config.lock.mode = LockMode::Blocking;
    }
    let runner = build_runner(&config)?;
    let processor = Arc::new(HttpJsonProcessor::from_config(&config.collector)?);
    let cancel = cancel_on_ctrl_c();

    let report = runner.run(processor, &cancel).await;
    if json {
        if let Some(summary) = &report.summary {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
    }
    Ok(report.exit_code())
}

async fn watch(config: HarvestConfig, now: bool) -> Result<i32> {
    let runner = Arc::new(build_runner(&config)?);
    let processor = Arc::new(HttpJsonProcessor::from_config(&config.collector)?);
    let cancel = cancel_on_ctrl_c();

    let handle = harvest_scheduler::spawn_job_loop(runner, processor, &config.schedule.cron, now, cancel)?;
    let stats = handle.await.context("job loop task")?;
    println!(
        "🌾 {} run(s): {} completed, {} no work, {} lock busy, {} cancelled, {} failed",
        stats.runs, stats.completed, stats.no_work, stats.lock_busy, stats.cancelled, stats.failed
    );
    Ok(0)
}

/// Replace the roster under the job's run lock, so a run in flight can
/// never write its cursor over the new roster.
async fn seed(config: &HarvestConfig, items_path: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(items_path)
        .with_context(|| format!("reading {}", items_path.display()))?;
    let items = parse_roster(&content);

    let lock = ExclusiveRunLock::from_config(&config.lock, &config.job);
    let mut guard = match lock.acquire().await {
        Ok(guard) => guard,
        Err(e) if e.is_benign() => {
            println!("⚠️  '{}' is running, roster left unchanged", config.job);
            return Ok(2);
        }
        Err(e) => return Err(e.into()),
    };

    let store = open_store(config)?;
    store.replace_roster(&items)?;
    guard.release();
    println!("🌱 Seeded '{}' with {} item(s)", config.job, items.len());
    Ok(0)
}

fn status(config: &HarvestConfig) -> Result<i32> {
    let store = open_store(config)?;
    let consumed = store.consumed_count()?;
    let source = BatchSource::open(store)?;
    let cursor = source.cursor();
    let lock_path = config.lock.resolve_path(&config.job);

    println!("🌾 Job:        {}", config.job);
    println!("   State:      {}", config.batch.resolve_state_path(&config.job).display());
    println!("   Roster:     {} item(s)", source.roster_len());
    println!("   Generation: {}", cursor.generation);
    println!("   Offset:     {}", cursor.offset.min(source.roster_len()));
    println!("   Requeued:   {}", cursor.requeued.len());
    println!("   Pending:    {}", source.pending_len());
    if let Some(consumed) = consumed {
        println!("   Consumed:   {consumed} item(s) logged");
    }
    match harvest_scheduler::cron::next_after(&config.schedule.cron, Utc::now()) {
        Ok(next) => println!("   Next tick:  {} ({})", next.to_rfc3339(), config.schedule.cron),
        Err(e) => println!("   Next tick:  ⚠️ {e}"),
    }
    match current_holder(&lock_path) {
        Some(holder) => println!(
            "   Lock:       🔒 held by pid {} since {}",
            holder.pid,
            holder.acquired_at.to_rfc3339()
        ),
        None => println!("   Lock:       🔓 free ({})", lock_path.display()),
    }
    Ok(0)
}

fn init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("⚠️  {} already exists (use --force to overwrite)", path.display());
        return Ok(1);
    }
    HarvestConfig::default().save_to(path)?;
    println!("✅ Default config written to {}", path.display());
    Ok(0)
}

/// One item per line; blank lines and `#` comments are ignored.
fn parse_roster(content: &str) -> Vec<WorkItem> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(WorkItem::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roster_skips_comments() {
        let items = parse_roster("# tech\nrust\n\n  r/golang  \n# done\n");
        assert_eq!(items, vec![WorkItem::new("rust"), WorkItem::new("r/golang")]);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["harvest", "--config", "/tmp/h.toml", "run", "--wait"]).unwrap();
        assert!(matches!(cli.command, Command::Run { wait: true, json: false }));
        assert_eq!(cli.config.as_deref(), Some("/tmp/h.toml"));

        let cli = Cli::try_parse_from(["harvest", "seed", "--items", "subs.txt"]).unwrap();
        assert!(matches!(cli.command, Command::Seed { .. }));
    }

    fn temp_config(dir: &Path) -> HarvestConfig {
        let mut config = HarvestConfig::default();
        config.lock.path = dir.join("job.lock").to_string_lossy().into_owned();
        config.batch.state_path = dir.join("state.json").to_string_lossy().into_owned();
        config
    }

    #[tokio::test]
    async fn test_seed_refuses_while_run_holds_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(dir.path());
        let store = open_store(&config).unwrap();
        store.replace_roster(&parse_roster("a\nb\nc\n")).unwrap();

        let items_path = dir.path().join("items.txt");
        std::fs::write(&items_path, "x\ny\nz\n").unwrap();

        // A run is in flight: it owns the lock and has cut a batch.
        let held = ExclusiveRunLock::from_config(&config.lock, &config.job)
            .try_acquire()
            .unwrap()
            .unwrap();
        let mut source = BatchSource::open(store.clone()).unwrap();
        let batch = source.next_batch(2).unwrap();

        assert_eq!(seed(&config, &items_path).await.unwrap(), 2);
        assert_eq!(store.load_roster().unwrap(), parse_roster("a\nb\nc"));

        source.abandon(&batch);
        drop(held);

        assert_eq!(seed(&config, &items_path).await.unwrap(), 0);
        let mut fresh = BatchSource::open(store).unwrap();
        let next = fresh.next_batch(10).unwrap();
        assert_eq!(next.items, parse_roster("x\ny\nz"));
    }

    #[test]
    fn test_status_on_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(dir.path());
        assert_eq!(status(&config).unwrap(), 0);
    }
}
