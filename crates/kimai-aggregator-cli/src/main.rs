//! Kimai Aggregator - command line front end.
//!
//! Signs in against the aggregator backend, pulls Kimai time tracking data
//! into a local cache, and saves user settings through the offline queue.

mod app;

use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;
use kimai_aggregator_core::config::Config;
use kimai_aggregator_core::models::ProjectProgress;
use kimai_aggregator_core::sync::SaveOutcome;

const LOG_FILE_PREFIX: &str = "kimai-aggregator.log";

#[derive(Parser)]
#[command(name = "kimai-aggregator", version, about = "Kimai time tracking aggregator")]
struct Cli {
    /// Kimai API token used for pulling time tracking data
    #[arg(long, env = "KIMAI_API_TOKEN", hide_env_values = true, global = true)]
    kimai_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in to the aggregator backend
    Login {
        /// Defaults to the last username used
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an account and sign in
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show session, cache and queue state
    Status,
    /// Fetch recent Kimai data and print a per-project summary
    Pull {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Print the summary from cached data only
    Summary,
    /// Save user settings (JSON object)
    Settings { json: String },
    /// Save a named data set (JSON value)
    Data { data_type: String, json: String },
    /// Inspect or drain the offline queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    List,
    Flush,
    /// Keep flushing until the queue is empty
    Drain {
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
    Remove { id: String },
    Clear,
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr, and also to a daily rolling file when `log_dir` is set.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: failed to load config, using defaults: {:#}", e);
            Config::default()
        }
    };

    let _log_guard = init_tracing(config.log_dir.as_deref());
    info!("Kimai Aggregator starting");

    let mut app = App::new(config, cli.kimai_token)?;
    let result = run(&mut app, cli.command).await;
    app.shutdown();
    result
}

async fn run(app: &mut App, command: Command) -> Result<()> {
    match command {
        Command::Login { email } => {
            let email = match email.or_else(|| app.config.last_username.clone()) {
                Some(email) => email,
                None => bail!("No email given (use --email)"),
            };
            let password = rpassword::prompt_password(format!("Password for {}: ", email))
                .context("Failed to read password")?;
            app.login(&email, &password).await?;
            println!("Signed in as {}", email);
        }
        Command::Register { name, email } => {
            let password = rpassword::prompt_password("Choose a password: ")
                .context("Failed to read password")?;
            app.register(&name, &email, &password).await?;
            println!("Registered and signed in as {}", email);
        }
        Command::Logout => {
            app.logout().await?;
            println!("Signed out");
        }
        Command::Status => print_status(app)?,
        Command::Pull { days } => {
            let progress = app.pull(days).await?;
            print_progress(&progress);
        }
        Command::Summary => {
            let (progress, ages) = app.cached_summary()?;
            print_progress(&progress);
            println!("\nLast updated: {}", ages.last_updated());
        }
        Command::Settings { json } => {
            let settings: Value = serde_json::from_str(&json).context("Settings must be valid JSON")?;
            if !settings.is_object() {
                bail!("Settings must be a JSON object");
            }
            report_save(app.save_settings(settings).await?);
        }
        Command::Data { data_type, json } => {
            let data: Value = serde_json::from_str(&json).context("Data must be valid JSON")?;
            report_save(app.save_data(&data_type, data).await?);
        }
        Command::Queue { action } => run_queue(app, action).await?,
    }
    Ok(())
}

async fn run_queue(app: &App, action: QueueAction) -> Result<()> {
    match action {
        QueueAction::List => {
            let operations = app.queued();
            if operations.is_empty() {
                println!("Queue is empty");
            }
            let now = Utc::now().timestamp_millis();
            for op in operations {
                println!(
                    "{}  {:<8} {:<12} retries={} age={}s",
                    op.id,
                    op.op_type.to_string(),
                    op.data_type.as_deref().unwrap_or("-"),
                    op.retries,
                    op.age_ms(now) / 1000
                );
            }
        }
        QueueAction::Flush => {
            let report = app.flush_queue().await;
            println!(
                "Sent {}, failed {}, dropped {}",
                report.sent, report.failed, report.dropped
            );
        }
        QueueAction::Drain { interval_secs } => {
            let pending = app.queued().len();
            app.drain_queue(Duration::from_secs(interval_secs.max(1))).await;
            println!("Drained {} queued operations", pending);
        }
        QueueAction::Remove { id } => {
            if !app.remove_queued(&id) {
                bail!("No queued operation with id {}", id);
            }
            println!("Removed {}", id);
        }
        QueueAction::Clear => {
            app.clear_queue();
            println!("Queue cleared");
        }
    }
    Ok(())
}

fn print_status(app: &App) -> Result<()> {
    match app.username() {
        Some(user) if app.is_authenticated() => println!("Signed in as {}", user),
        _ => println!("Not signed in"),
    }

    let (_, ages) = app.cached_summary()?;
    println!(
        "Cache: projects {}, activities {} ({} cached), timesheets {}{}",
        ages.projects.as_deref().unwrap_or("never"),
        ages.activities.as_deref().unwrap_or("never"),
        app.cached_activity_count()?,
        ages.timesheets.as_deref().unwrap_or("never"),
        if app.is_cache_stale() { " (stale)" } else { "" }
    );
    println!("Queued operations: {}", app.queued().len());
    Ok(())
}

fn print_progress(progress: &[ProjectProgress]) {
    if progress.is_empty() {
        println!("No time recorded");
        return;
    }
    for p in progress {
        let budget = match p.time_used_percent() {
            Some(percent) => format!("{:>5.0}% of time budget", percent),
            None => String::new(),
        };
        let flag = if p.is_over_budget() { "  OVER" } else { "" };
        println!(
            "{:<32} {:>8.2}h {:>10.2} {}{}",
            p.name, p.hours, p.revenue, budget, flag
        );
    }
}

fn report_save(outcome: SaveOutcome) {
    match outcome {
        SaveOutcome::Sent(_) => println!("Saved"),
        SaveOutcome::Queued(id) => println!("Backend unreachable, queued as {}", id),
    }
}
