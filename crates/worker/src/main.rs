//! Repurpose Background Worker
//!
//! Handles scheduled jobs including:
//! - Expired code deactivation (daily at 00:05 UTC)
//! - Monthly credit refresh for overdue plans (hourly)
//! - Ledger reconciliation checks (daily at 03:30 UTC)

mod jobs;

use std::path::PathBuf;
use std::time::Duration;

use repurpose_credits::{CreditEngine, TierTable, DEFAULT_LOCK_TIMEOUT_MS};
use repurpose_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

const WORKER_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Repurpose Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let lock_timeout_ms = match std::env::var("LOCK_TIMEOUT_MS") {
        Ok(raw) => raw.parse()?,
        Err(_) => DEFAULT_LOCK_TIMEOUT_MS,
    };
    let tier_config_path = std::env::var("TIER_CONFIG_PATH").ok().map(PathBuf::from);

    let pool = create_pool(&database_url, WORKER_MAX_CONNECTIONS).await?;
    info!("Database pool created");

    let tiers = TierTable::load(tier_config_path.as_deref())?;
    let engine = CreditEngine::new(pool, tiers, lock_timeout_ms);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Deactivate expired codes
    let expiry_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 5 0 * * *", move |_uuid, _l| {
            let engine = expiry_engine.clone();
            Box::pin(async move {
                info!("Running expired code sweep");
                jobs::expire_codes(&engine).await;
            })
        })?)
        .await?;
    info!("Scheduled: Expired code sweep (00:05 UTC)");

    // Job 2: Monthly credit refresh. Plans are also reset lazily on read,
    // so this only catches users who have gone quiet.
    let refresh_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let engine = refresh_engine.clone();
            Box::pin(async move {
                info!("Running credit refresh");
                jobs::refresh_credits(&engine).await;
            })
        })?)
        .await?;
    info!("Scheduled: Credit refresh (hourly at :15)");

    // Job 3: Reconciliation
    let invariant_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let engine = invariant_engine.clone();
            Box::pin(async move {
                info!("Running invariant checks");
                jobs::check_invariants(&engine).await;
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (03:30 UTC)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Repurpose Worker started successfully with 3 scheduled jobs");

    // Keep the main task running
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
