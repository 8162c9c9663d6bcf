//! deskpulse - capture screen activity and turn it into focus metrics
//!
//! Commands:
//! - `run`: start the capture service in the foreground (Ctrl+C to stop)
//! - `status`: show store contents and whether a service is running
//! - `metrics`: print the daily view for one date as JSON
//! - `export`: print daily views for a date range plus a summary as JSON
//! - `inspect`: list recent buckets with their activities and contexts
//! - `prune`: delete records older than the retention window
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/deskpulse/data.db (~/.local/share/deskpulse/data.db)
//! - Logs: $XDG_STATE_HOME/deskpulse/deskpulse.log (~/.local/state/deskpulse/deskpulse.log)
//! - Config: $XDG_CONFIG_HOME/deskpulse/config.toml (~/.config/deskpulse/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use deskpulse_core::analysis::HttpVisionAnalyzer;
use deskpulse_core::capture::CommandCaptureSource;
use deskpulse_core::{Config, Database, ServiceRunner};
use process_lock::{acquire_service_guard, service_running};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "deskpulse")]
#[command(about = "Screen-activity focus tracker")]
#[command(version)]
struct Args {
    /// Verbose output (write a log file for read-only commands too)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the capture service in the foreground
    Run,

    /// Show store contents and service state
    Status,

    /// Print the daily metrics view as JSON
    Metrics {
        /// UTC date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Export daily views for a date range as JSON
    Export {
        /// First UTC date (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,

        /// Last UTC date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List recent buckets with their activities and contexts
    Inspect {
        /// How far back to look, in hours
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },

    /// Delete records older than the retention window
    Prune {
        /// Retention in days (default: from config)
        #[arg(long)]
        days: Option<u32>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    // `run` always logs to file and stderr; other commands only with --verbose
    let _log_guard = match args.command {
        Command::Run => None,
        _ if args.verbose => Some(
            deskpulse_core::logging::init(&config.logging, false)
                .context("failed to initialize logging")?,
        ),
        _ => None,
    };

    match args.command {
        Command::Run => cmd_run(config),
        Command::Status => cmd_status(&config),
        Command::Metrics { date } => cmd_metrics(date),
        Command::Export { start, end, output } => cmd_export(start, end, output),
        Command::Inspect { hours } => cmd_inspect(hours),
        Command::Prune { days } => cmd_prune(&config, days),
    }
}

fn open_database() -> Result<Database> {
    let db_path = Config::database_path();
    tracing::debug!(path = %db_path.display(), "Opening database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(db)
}

fn cmd_run(config: Config) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let _log_guard = deskpulse_core::logging::init(&config.logging, true)
        .context("failed to initialize logging")?;

    let db_path = Config::database_path();
    let _service_guard = acquire_service_guard(&db_path).context("failed to acquire process lock")?;

    let analyzer = HttpVisionAnalyzer::new(&config.analysis)
        .context("analysis endpoint is not configured; set [analysis] endpoint in config.toml")?;
    let source = CommandCaptureSource::from_config(&config.capture, Config::capture_scratch_dir())
        .context("failed to set up screen capture")?;
    let db = open_database()?;

    println!("Database: {}", db_path.display());
    println!("Log file: {}", deskpulse_core::logging::log_file_path().display());
    println!(
        "Capturing every {}s, batches of {}. Press Ctrl+C to stop.",
        config.capture.screenshot_interval_seconds, config.batch.batch_size
    );

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        token.cancel();
    })
    .context("failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let runner = ServiceRunner::new(config, Arc::new(source), Arc::new(analyzer), Arc::new(db));
    let summary = runtime.block_on(runner.run(shutdown))?;

    println!();
    println!("Captures:           {}", summary.captures);
    println!("Capture errors:     {}", summary.capture_errors);
    println!("Batches completed:  {}", summary.batches_completed);
    println!("Batches failed:     {}", summary.batches_failed);
    println!("Left for next run:  {}", summary.batches_interrupted);
    if summary.recovered_batches > 0 {
        println!("Recovered at start: {}", summary.recovered_batches);
    }
    if summary.late_results > 0 {
        println!("Late results:       {}", summary.late_results);
    }

    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let db_path = Config::database_path();
    let db = open_database()?;
    let status = db.status().context("failed to read store status")?;
    let running = service_running(&db_path).context("failed to check service lock")?;

    println!("deskpulse status");
    println!("================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("Schema version:    {}", status.schema_version);
    println!("Service:           {}", if running { "running" } else { "stopped" });
    println!(
        "Endpoint:          {}",
        config.analysis.endpoint.as_deref().unwrap_or("<not set>")
    );
    println!();
    println!("Captures:          {}", status.total_captures);
    println!("Unanalyzed:        {}", status.unanalyzed_captures);
    println!("Pending batches:   {}", status.pending_batches);
    println!("Completed batches: {}", status.completed_batches);
    println!("Failed batches:    {}", status.failed_batches);
    println!("Buckets:           {}", status.bucket_count);
    println!(
        "Last capture:      {}",
        status
            .last_capture_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );

    if let Some(bucket) = status.latest_bucket {
        println!();
        println!("Latest bucket:     {}", bucket.bucket_start.to_rfc3339());
        println!("  Focus score:     {:.1}", bucket.focus_score);
        println!("  Captures:        {}", bucket.total_captures);
        println!("  Switches:        {}", bucket.context_switches);
        println!("  Finalized:       {}", bucket.finalized);
        if bucket.has_gap() {
            println!("  Unanalyzed:      {}", bucket.unanalyzed_captures);
        }
    }

    Ok(())
}

fn cmd_metrics(date: Option<NaiveDate>) -> Result<()> {
    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    let db = open_database()?;
    let metrics = db
        .daily_metrics(date)
        .with_context(|| format!("failed to load metrics for {}", date))?;

    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn cmd_export(start: NaiveDate, end: NaiveDate, output: Option<PathBuf>) -> Result<()> {
    let db = open_database()?;
    let export = db
        .metrics_range(start, end)
        .with_context(|| format!("failed to export {} to {}", start, end))?;
    let json = serde_json::to_string_pretty(&export)?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Exported {} day(s) to {}", export.days.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn cmd_inspect(hours: u32) -> Result<()> {
    let end = Utc::now();
    let start = end - chrono::Duration::hours(hours as i64);
    let db = open_database()?;
    let recent = db
        .recent_activity(start, end)
        .context("failed to load recent activity")?;

    if recent.periods.is_empty() {
        println!("No summaries found in the last {} hour(s)", hours);
        return Ok(());
    }

    println!(
        "{:<6} {:<40} {:>9}  {}",
        "Time", "Activities", "Snapshots", "Summary"
    );
    println!("{}", "-".repeat(90));
    for period in &recent.periods {
        println!(
            "{:<6} {:<40} {:>9}  {}",
            period.bucket_start.format("%H:%M"),
            truncate(&period.activities.join(", "), 40),
            period.snapshots,
            truncate(&period.contexts.join("; "), 60)
        );
    }

    println!();
    println!("Total time periods: {}", recent.periods.len());
    println!("Total snapshots:    {}", recent.total_snapshots);
    println!("Unique activities:  {}", recent.unique_activities);
    Ok(())
}

/// Shorten `s` to at most `max` characters, marking the cut with "..."
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn cmd_prune(config: &Config, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(config.retention.data_retention_days);
    if days == 0 {
        anyhow::bail!("retention must be at least 1 day");
    }

    let cutoff = Utc::now() - chrono::Duration::days(days as i64);
    let db = open_database()?;
    let stats = db.prune(cutoff).context("failed to prune records")?;

    println!("Pruned records older than {}", cutoff.to_rfc3339());
    println!("  Captures:     {}", stats.captures);
    println!("  Buckets:      {}", stats.buckets);
    println!("  Batch events: {}", stats.batch_events);
    Ok(())
}
