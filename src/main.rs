// Membank — consolidation scheduler CLI.
//
// Two modes:
//   membank --once          run a single consolidation pass and exit
//   membank --interval N    run continuously every N seconds (Ctrl+C stops)
//
// Exit codes: 0 success, 1 operational failure, 2 configuration error.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use log::{error, info};

use membank::engine::{db, scheduler};
use membank::EngineError;

/// Consolidation scheduler for the membank memory engine.
#[derive(Parser, Debug)]
#[command(name = "membank", version, about, long_about = None)]
struct Cli {
    /// Run a single consolidation pass and exit.
    #[arg(long, conflicts_with = "interval")]
    once: bool,

    /// Run continuously, consolidating every N seconds.
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env loads before anything reads configuration; accessors are lazy so
    // this ordering is all that matters.
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let pool = match db::create_pool().await {
        Ok(pool) => pool,
        Err(e @ EngineError::Config(_)) => {
            error!("{e}");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let code = match cli.interval {
        Some(interval_secs) => run_continuous(&pool, interval_secs).await,
        None => run_once(&pool).await,
    };

    db::close_pool(&pool).await;
    code
}

async fn run_once(pool: &sqlx::PgPool) -> ExitCode {
    let shutdown = AtomicBool::new(false);
    match scheduler::run_all_banks(pool, &shutdown).await {
        Ok(runs) => {
            let processed: usize = runs.iter().map(|(_, s)| s.processed).sum();
            let created: usize = runs.iter().map(|(_, s)| s.observations_created).sum();
            let updated: usize = runs.iter().map(|(_, s)| s.observations_updated).sum();
            info!(
                "Consolidation pass complete: banks={}, processed={}, created={}, updated={}",
                runs.len(),
                processed,
                created,
                updated
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Consolidation pass failed: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run_continuous(pool: &sqlx::PgPool, interval_secs: u64) -> ExitCode {
    let interval = interval_secs.max(1);
    info!("Running consolidation every {interval}s (Ctrl+C to stop)");

    let mut failed = false;
    loop {
        let shutdown = AtomicBool::new(false);
        match scheduler::run_all_banks(pool, &shutdown).await {
            Ok(runs) => {
                let processed: usize = runs.iter().map(|(_, s)| s.processed).sum();
                info!("Pass complete: banks={}, processed={}", runs.len(), processed);
            }
            Err(e) => {
                failed = true;
                error!("Pass failed: {e}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    if failed { ExitCode::from(1) } else { ExitCode::SUCCESS }
}
