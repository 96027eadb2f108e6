pub mod accounts;
pub mod credits;
pub mod fraud;
pub mod ids;
pub mod lock_manager;
pub mod maintenance;
pub mod processor;
pub mod scheduler;

pub use accounts::{AccountService, AccountStatistics};
pub use credits::{CreditBalanceService, RefillReport};
pub use fraud::{FraudPolicy, FraudRiskEngine};
pub use ids::{IdGenerator, RandomIds};
pub use lock_manager::{AccountLocker, LocalAccountLocks, Lock, LockManager};
pub use maintenance::{HealthReport, MaintenanceReport, MaintenanceScheduler, SystemHealth};
pub use processor::{DepositRequest, PurchaseRequest, RequestMetadata, TransactionProcessor};
pub use scheduler::{CreditRefillJob, Job, JobScheduler, JobStatus, MaintenanceJob};
