//! Cron-driven periodic job runner.
//!
//! Schedules use the six-field `cron` syntax (seconds first) and are
//! evaluated in UTC. A failing run is logged and the job keeps its schedule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::services::credits::CreditBalanceService;
use crate::services::maintenance::MaintenanceScheduler;

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn schedule(&self) -> &str;

    async fn execute(&self) -> Result<(), JobError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}' for job {job}: {source}")]
    InvalidSchedule {
        job: String,
        expression: String,
        source: cron::error::Error,
    },
    #[error("A job named {0} is already registered")]
    DuplicateJob(String),
    #[error("Scheduler is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub schedule: String,
    pub is_active: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
}

struct RegisteredJob {
    job: Arc<dyn Job>,
    schedule: Schedule,
}

pub struct JobScheduler {
    jobs: RwLock<Vec<RegisteredJob>>,
    status: Arc<RwLock<HashMap<String, JobStatus>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: RwLock::new(Vec::new()),
            status: Arc::new(RwLock::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub async fn register_job(&self, job: Box<dyn Job>) -> Result<(), SchedulerError> {
        let name = job.name().to_string();
        let expression = job.schedule().to_string();
        let schedule = Schedule::from_str(&expression).map_err(|source| SchedulerError::InvalidSchedule {
            job: name.clone(),
            expression: expression.clone(),
            source,
        })?;

        let mut status = self.status.write().await;
        if status.contains_key(&name) {
            return Err(SchedulerError::DuplicateJob(name));
        }
        status.insert(
            name.clone(),
            JobStatus {
                name: name.clone(),
                schedule: expression,
                is_active: false,
                next_run: None,
                last_run: None,
                last_error: None,
                run_count: 0,
            },
        );

        self.jobs.write().await.push(RegisteredJob {
            job: Arc::from(job),
            schedule,
        });
        info!("Registered job {}", name);
        Ok(())
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.shutdown.send_replace(false);

        let jobs = self.jobs.read().await;
        let mut status = self.status.write().await;
        for registered in jobs.iter() {
            let name = registered.job.name().to_string();
            if let Some(entry) = status.get_mut(&name) {
                entry.is_active = true;
                entry.next_run = registered.schedule.upcoming(Utc).next();
            }

            handles.push(tokio::spawn(run_job(
                registered.job.clone(),
                registered.schedule.clone(),
                self.status.clone(),
                self.shutdown.subscribe(),
            )));
        }

        info!("Job scheduler started with {} jobs", jobs.len());
        Ok(())
    }

    /// Signals every job loop to exit and waits for in-flight runs to finish.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Job task ended abnormally: {}", e);
            }
        }

        for entry in self.status.write().await.values_mut() {
            entry.is_active = false;
            entry.next_run = None;
        }
        info!("Job scheduler stopped");
        Ok(())
    }

    pub async fn get_job_status(&self) -> HashMap<String, JobStatus> {
        self.status.read().await.clone()
    }
}

async fn run_job(
    job: Arc<dyn Job>,
    schedule: Schedule,
    status: Arc<RwLock<HashMap<String, JobStatus>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = job.name().to_string();

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("Job {} has no upcoming runs, stopping it", name);
            break;
        };
        if let Some(entry) = status.write().await.get_mut(&name) {
            entry.next_run = Some(next);
        }

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let result = job.execute().await;
        let mut guard = status.write().await;
        let entry = guard.get_mut(&name);
        match result {
            Ok(()) => {
                if let Some(entry) = entry {
                    entry.last_error = None;
                    entry.last_run = Some(Utc::now());
                    entry.run_count += 1;
                }
            }
            Err(e) => {
                error!("Job {} failed: {}", name, e);
                if let Some(entry) = entry {
                    entry.last_error = Some(e.to_string());
                    entry.last_run = Some(Utc::now());
                    entry.run_count += 1;
                }
            }
        }
    }
}

/// Runs [`MaintenanceScheduler::run_once`] on a schedule. A run with failed
/// steps is reported as a job failure.
pub struct MaintenanceJob {
    maintenance: Arc<MaintenanceScheduler>,
    schedule: String,
}

impl MaintenanceJob {
    pub fn new(maintenance: Arc<MaintenanceScheduler>, schedule: impl Into<String>) -> Self {
        Self {
            maintenance,
            schedule: schedule.into(),
        }
    }
}

#[async_trait]
impl Job for MaintenanceJob {
    fn name(&self) -> &str {
        "ledger_maintenance"
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    async fn execute(&self) -> Result<(), JobError> {
        let report = self.maintenance.run_once().await;
        if report.errors.is_empty() {
            Ok(())
        } else {
            Err(report.errors.join("; ").into())
        }
    }
}

pub struct CreditRefillJob {
    credits: Arc<CreditBalanceService>,
    schedule: String,
}

impl CreditRefillJob {
    pub fn new(credits: Arc<CreditBalanceService>, schedule: impl Into<String>) -> Self {
        Self {
            credits,
            schedule: schedule.into(),
        }
    }
}

#[async_trait]
impl Job for CreditRefillJob {
    fn name(&self) -> &str {
        "credit_refill"
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    async fn execute(&self) -> Result<(), JobError> {
        self.credits.refill_all().await?;
        Ok(())
    }
}
