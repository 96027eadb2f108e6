pub mod clock;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod ports;
pub mod services;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{Config, LedgerPolicy};
pub use crate::error::{ErrorBody, ErrorKind, LedgerError, Result};
pub use crate::ledger::{Ledger, LedgerBuilder};
