use clap::{Parser, Subcommand};
use credit_ledger::config::Config;
use credit_ledger::db::{self, PgLedgerStore};
use credit_ledger::services::{
    AccountLocker, CreditRefillJob, JobScheduler, LocalAccountLocks, LockManager, MaintenanceJob,
};
use credit_ledger::Ledger;
use std::path::Path;
use std::sync::Arc;

/// Seconds a distributed account lock survives if its holder dies.
const LOCK_TTL_SECS: u64 = 30;

#[derive(Parser)]
#[command(name = "credit-ledger")]
#[command(about = "Credit Ledger - account balances, credit purchases and fraud screening", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the maintenance and credit refill schedules until interrupted (default)
    Worker,

    /// Run a single maintenance pass and print the report as JSON
    Maintenance,

    /// Run database migrations
    Migrate,

    /// Configuration validation
    Config,
}

async fn build_ledger(config: &Config) -> anyhow::Result<Ledger> {
    let pool = db::create_pool(config).await?;
    let store = Arc::new(PgLedgerStore::new(pool));

    let locks: Arc<dyn AccountLocker> = match &config.redis_url {
        Some(url) => {
            tracing::info!("Using Redis account locks");
            Arc::new(LockManager::new(url, LOCK_TTL_SECS)?.with_acquire_timeout(config.policy.lock_timeout))
        }
        None => {
            tracing::info!("No REDIS_URL configured, using in-process account locks");
            Arc::new(LocalAccountLocks::new(config.policy.lock_timeout))
        }
    };

    Ok(Ledger::builder()
        .policy(config.policy.clone())
        .locks(locks)
        .build(store))
}

pub async fn handle_worker(config: &Config) -> anyhow::Result<()> {
    let ledger = build_ledger(config).await?;

    let scheduler = JobScheduler::new();
    scheduler
        .register_job(Box::new(MaintenanceJob::new(
            ledger.maintenance(),
            config.maintenance_schedule.clone(),
        )))
        .await?;
    scheduler
        .register_job(Box::new(CreditRefillJob::new(
            ledger.credits(),
            config.credit_refill_schedule.clone(),
        )))
        .await?;
    scheduler.start().await?;

    tracing::info!("Worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    scheduler.stop().await?;
    Ok(())
}

pub async fn handle_maintenance(config: &Config) -> anyhow::Result<()> {
    let ledger = build_ledger(config).await?;
    let report = ledger.run_maintenance().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.errors.is_empty() {
        anyhow::bail!("{} maintenance steps failed", report.errors.len());
    }
    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    db::run_migrations(&pool, Path::new("./migrations")).await?;
    println!("✓ Database migrations completed");

    Ok(())
}

pub fn handle_config_validate(config: &Config, profile: &str, overrides: &[String]) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration ({} profile):", profile);
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!(
        "  Redis URL: {}",
        config.redis_url.as_deref().map(mask_password).unwrap_or_else(|| "(in-process locks)".to_string())
    );
    println!("  Max DB connections: {}", config.db_max_connections);
    println!("  Maintenance schedule: {}", config.maintenance_schedule);
    println!("  Credit refill schedule: {}", config.credit_refill_schedule);
    println!("  Default verification tier: {}", config.policy.default_verification_tier.as_str());
    println!("  Fraud pass threshold: {}", config.policy.fraud.pass_threshold);
    println!("  Lock timeout: {:?}", config.policy.lock_timeout);
    println!(
        "  Auto-freeze: after {} failures for {}h",
        config.policy.auto_freeze_after_failures,
        config.policy.auto_freeze_duration.num_hours()
    );
    println!("  Failed transaction expiry: {}h", config.policy.failed_tx_expiry.num_hours());
    if !overrides.is_empty() {
        println!("  Overridden from environment: {}", overrides.join(", "));
    }

    for (name, expression) in [
        ("MAINTENANCE_SCHEDULE", &config.maintenance_schedule),
        ("CREDIT_REFILL_SCHEDULE", &config.credit_refill_schedule),
    ] {
        <cron::Schedule as std::str::FromStr>::from_str(expression)
            .map_err(|e| anyhow::anyhow!("{} is not a valid cron expression: {}", name, e))?;
    }

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
