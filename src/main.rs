use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod dispatch;
mod error;
mod mailer;
mod models;
mod overdue;
mod preview;
mod scheduler;

use config::{NotifyConfig, SmtpConfig};
use db::PgProgressStore;
use dispatch::{DispatchSettings, OverdueNotifier};
use mailer::{Notifier, SmtpNotifier};
use scheduler::{Scheduler, SystemClock};

#[derive(Parser)]
#[command(name = "overdue-notifier")]
#[command(about = "Overdue course notifications for Nifty Learning", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample users, courses and progress
    Seed,
    /// List overdue courses per user without sending anything
    Scan {
        /// Print bundles as JSON instead of a summary
        #[arg(long)]
        json: bool,
        /// Also write one row per overdue course to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Run one notification cycle now
    Notify {
        /// Pause between sends, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Run the daily notification schedule until interrupted
    Run {
        /// Cron expression (MIN HOUR DOM MON DOW), defaults to 09:00 daily
        #[arg(long)]
        schedule: Option<String>,
        /// Pause between sends, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Also run one cycle immediately after starting
        #[arg(long)]
        now: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to the progress Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let summary = db::seed(&pool).await?;
            println!(
                "Seeded {} users, {} courses and {} progress records ({} overdue).",
                summary.users, summary.courses, summary.progress, summary.overdue
            );
        }
        Commands::Scan { json, csv } => {
            let bundles = dispatch::preview(&PgProgressStore::new(pool))
                .await
                .context("overdue scan failed")?;

            if let Some(path) = csv.as_deref() {
                let written = preview::write_csv(path, &bundles)?;
                println!("Wrote {written} overdue courses to {}.", path.display());
            }

            if json {
                println!("{}", preview::to_json(&bundles)?);
            } else {
                print!("{}", preview::summary(&bundles));
            }
        }
        Commands::Notify { delay_ms } => {
            let config = NotifyConfig::from_env()?;
            let mailer = SmtpNotifier::new(&SmtpConfig::from_env()?)?;
            let report = overdue_notifier(pool, &config, delay_ms, mailer)
                .run_cycle()
                .await
                .context("overdue notification cycle failed")?;
            println!(
                "Attempted {} notifications for {} users ({} failed, {} overdue courses).",
                report.attempted, report.bundles, report.failed, report.rows
            );
        }
        Commands::Run {
            schedule,
            delay_ms,
            now,
        } => {
            let config = NotifyConfig::from_env()?;
            let mailer = SmtpNotifier::new(&SmtpConfig::from_env()?)?;
            let job = Arc::new(overdue_notifier(pool, &config, delay_ms, mailer));
            let cron = schedule.unwrap_or_else(|| config.schedule.clone());

            let mut scheduler = Scheduler::new(Arc::new(SystemClock));
            dispatch::schedule_overdue_notifications(&mut scheduler, job, &cron)?;
            scheduler.start();
            for name in scheduler.job_names() {
                tracing::info!(job = name, state = ?scheduler.state(name), schedule = %cron, "job registered");
            }

            if now {
                scheduler.run_now(dispatch::JOB_NAME).await;
            }

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            tracing::info!("shutting down; waiting for any cycle in progress");
            scheduler.shutdown().await;
            tracing::info!("scheduler stopped");
        }
    }

    Ok(())
}

fn overdue_notifier<N: Notifier>(
    pool: PgPool,
    config: &NotifyConfig,
    delay_ms: Option<u64>,
    notifier: N,
) -> OverdueNotifier<PgProgressStore, N> {
    let settings = DispatchSettings {
        from: config.from.clone(),
        send_delay: delay_ms.map(Duration::from_millis).unwrap_or(config.send_delay),
    };
    OverdueNotifier::new(PgProgressStore::new(pool), notifier, settings)
}
