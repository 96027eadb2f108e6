//! Maintenance Scheduler run.
//!
//! One pass lifts expired freezes, zeroes spend counters from past windows,
//! ages out stale transactions and grades overall ledger health. Every step
//! is isolated: a failing step is logged and reported, the rest still run.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::LedgerPolicy;
use crate::error::{LedgerError, Result};
use crate::ports::{LedgerStore, StatusCounts};

pub const ABANDONED_REASON: &str = "abandoned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// PENDING rows older than this count as stuck.
    pub stuck_after: Duration,
    pub critical_success_rate: f64,
    pub degraded_success_rate: f64,
    pub critical_stuck: i64,
    pub degraded_stuck: i64,
    pub degraded_frozen: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stuck_after: Duration::minutes(30),
            critical_success_rate: 0.5,
            degraded_success_rate: 0.8,
            critical_stuck: 50,
            degraded_stuck: 10,
            degraded_frozen: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: SystemHealth,
    /// Over the trailing 24 hours; `None` when nothing was finalized.
    pub success_rate: Option<f64>,
    pub counts: StatusCounts,
    pub stuck_pending: i64,
    pub frozen_accounts: i64,
    pub alerts: Vec<String>,
}

impl HealthReport {
    fn grade(
        counts: StatusCounts,
        stuck_pending: i64,
        frozen_accounts: i64,
        thresholds: &HealthThresholds,
    ) -> Self {
        let success_rate = counts.success_rate();
        let mut critical = Vec::new();
        let mut degraded = Vec::new();

        if let Some(rate) = success_rate {
            if rate < thresholds.critical_success_rate {
                critical.push(format!("success rate {:.1}% over the last 24h", rate * 100.0));
            } else if rate < thresholds.degraded_success_rate {
                degraded.push(format!("success rate {:.1}% over the last 24h", rate * 100.0));
            }
        }
        if stuck_pending > thresholds.critical_stuck {
            critical.push(format!("{} transactions stuck in PENDING", stuck_pending));
        } else if stuck_pending > thresholds.degraded_stuck {
            degraded.push(format!("{} transactions stuck in PENDING", stuck_pending));
        }
        if frozen_accounts > thresholds.degraded_frozen {
            degraded.push(format!("{} accounts frozen", frozen_accounts));
        }

        let status = if !critical.is_empty() {
            SystemHealth::Critical
        } else if !degraded.is_empty() {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        };

        critical.extend(degraded);
        Self {
            status,
            success_rate,
            counts,
            stuck_pending,
            frozen_accounts,
            alerts: critical,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub unfrozen: u64,
    pub limits_reset: u64,
    pub expired: u64,
    pub abandoned: u64,
    pub health: Option<HealthReport>,
    /// One entry per step that failed.
    pub errors: Vec<String>,
}

pub struct MaintenanceScheduler {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    failed_tx_expiry: Duration,
    thresholds: HealthThresholds,
}

impl MaintenanceScheduler {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, policy: &LedgerPolicy) -> Self {
        Self {
            store,
            clock,
            failed_tx_expiry: policy.failed_tx_expiry,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn run_once(&self) -> MaintenanceReport {
        let started_at = self.clock.now();
        info!("Starting ledger maintenance run");

        let mut report = MaintenanceReport {
            started_at,
            unfrozen: 0,
            limits_reset: 0,
            expired: 0,
            abandoned: 0,
            health: None,
            errors: Vec::new(),
        };

        match self.unfreeze_expired().await {
            Ok(n) => report.unfrozen = n,
            Err(e) => fail_step(&mut report, "unfreeze expired accounts", e),
        }

        match self.reset_limit_windows().await {
            Ok(n) => report.limits_reset = n,
            Err(e) => fail_step(&mut report, "reset limit windows", e),
        }

        match self.expire_stale_transactions().await {
            Ok((expired, abandoned)) => {
                report.expired = expired;
                report.abandoned = abandoned;
            }
            Err(e) => fail_step(&mut report, "expire stale transactions", e),
        }

        match self.check_health().await {
            Ok(health) => {
                match health.status {
                    SystemHealth::Critical => error!("Ledger health CRITICAL: {}", health.alerts.join("; ")),
                    SystemHealth::Degraded => warn!("Ledger health DEGRADED: {}", health.alerts.join("; ")),
                    SystemHealth::Healthy => {}
                }
                report.health = Some(health);
            }
            Err(e) => fail_step(&mut report, "health check", e),
        }

        info!(
            "Ledger maintenance completed: {} unfrozen, {} limit resets, {} expired, {} abandoned, {} step failures",
            report.unfrozen,
            report.limits_reset,
            report.expired,
            report.abandoned,
            report.errors.len()
        );
        report
    }

    pub async fn unfreeze_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut unfrozen = 0;

        for mut account in self.store.list_frozen_accounts().await? {
            if !account.is_freeze_expired(now) {
                continue;
            }
            account.unfreeze(now);
            match self.store.update_account(&account).await {
                Ok(_) => {
                    info!("Unfroze account {}", account.account_number);
                    unfrozen += 1;
                }
                // a concurrent writer got there first; the next run or read picks it up
                Err(e) => warn!("Could not unfreeze account {}: {}", account.account_number, e),
            }
        }
        Ok(unfrozen)
    }

    pub async fn reset_limit_windows(&self) -> Result<u64> {
        let now = self.clock.now();
        let (day_start, month_start) = window_starts(now)?;
        let mut reset = 0;

        for mut account in self.store.list_accounts_due_for_reset(day_start, month_start).await? {
            if !account.roll_limit_windows(now) {
                continue;
            }
            match self.store.update_account(&account).await {
                Ok(_) => reset += 1,
                Err(e) => warn!("Could not reset limits on account {}: {}", account.account_number, e),
            }
        }
        Ok(reset)
    }

    /// Returns `(expired, abandoned)`.
    pub async fn expire_stale_transactions(&self) -> Result<(u64, u64)> {
        let now = self.clock.now();
        let cutoff = now - self.failed_tx_expiry;

        let expired = self.store.expire_failed_before(cutoff, now).await?;
        let abandoned = self.store.fail_pending_before(cutoff, ABANDONED_REASON, now).await?;
        if abandoned > 0 {
            warn!("Closed out {} abandoned PENDING transactions", abandoned);
        }
        Ok((expired, abandoned))
    }

    pub async fn check_health(&self) -> Result<HealthReport> {
        let now = self.clock.now();
        let counts = self.store.status_counts_since(now - Duration::hours(24)).await?;
        let stuck = self.store.count_pending_before(now - self.thresholds.stuck_after).await?;
        let frozen = self.store.count_frozen_accounts().await?;
        Ok(HealthReport::grade(counts, stuck, frozen, &self.thresholds))
    }
}

fn fail_step(report: &mut MaintenanceReport, step: &str, e: LedgerError) {
    error!("Maintenance step '{}' failed: {}", step, e);
    report.errors.push(format!("{}: {}", step, e));
}

/// Midnight today and midnight on the first of the month, UTC.
fn window_starts(now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let day = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| LedgerError::processing("invalid day boundary"))?;
    let month = now
        .date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| LedgerError::processing("invalid month boundary"))?;
    Ok((Utc.from_utc_datetime(&day), Utc.from_utc_datetime(&month)))
}
