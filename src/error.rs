use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use uuid::Uuid;

use crate::domain::{AccountStatus, RiskTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitWindow {
    Daily,
    Monthly,
}

impl fmt::Display for LimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitWindow::Daily => f.write_str("daily"),
            LimitWindow::Monthly => f.write_str("monthly"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("User {user_id} already has a ledger account")]
    DuplicateAccount { user_id: Uuid },
    #[error("Policy violation: {0}")]
    PolicyViolation(String),
    #[error("Account is frozen: {}", .reason.as_deref().unwrap_or("no reason recorded"))]
    AccountFrozen {
        reason: Option<String>,
        until: Option<DateTime<Utc>>,
    },
    #[error("Account is not active (status {status})")]
    AccountNotActive { status: AccountStatus },
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: BigDecimal,
        available: BigDecimal,
    },
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits {
        required: i64,
        available: i64,
        shortfall: i64,
    },
    #[error("Unknown credit package: {0}")]
    UnknownPackage(String),
    #[error("Transaction {transaction_id} blocked by fraud screening: {reason}")]
    FraudBlocked {
        transaction_id: String,
        risk_score: i32,
        risk_tier: RiskTier,
        reason: String,
    },
    #[error("{window} limit exceeded: requested {requested}, remaining {remaining}")]
    LimitExceeded {
        window: LimitWindow,
        limit: BigDecimal,
        spent: BigDecimal,
        requested: BigDecimal,
        remaining: BigDecimal,
    },
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
    #[error("Processing error: {message}")]
    Processing {
        transaction_id: Option<String>,
        message: String,
    },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Stable, machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    DuplicateAccount,
    PolicyViolation,
    AccountFrozen,
    AccountNotActive,
    InsufficientBalance,
    InsufficientCredits,
    UnknownPackage,
    FraudBlocked,
    LimitExceeded,
    Conflict,
    ProcessingError,
}

/// Serializable error envelope handed to collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<&'static str>,
}

impl LedgerError {
    pub fn processing(message: impl Into<String>) -> Self {
        LedgerError::Processing {
            transaction_id: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_) => ErrorKind::ValidationError,
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::DuplicateAccount { .. } => ErrorKind::DuplicateAccount,
            LedgerError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            LedgerError::AccountFrozen { .. } => ErrorKind::AccountFrozen,
            LedgerError::AccountNotActive { .. } => ErrorKind::AccountNotActive,
            LedgerError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            LedgerError::InsufficientCredits { .. } => ErrorKind::InsufficientCredits,
            LedgerError::UnknownPackage(_) => ErrorKind::UnknownPackage,
            LedgerError::FraudBlocked { .. } => ErrorKind::FraudBlocked,
            LedgerError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            LedgerError::Conflict(_) => ErrorKind::Conflict,
            LedgerError::Processing { .. } | LedgerError::Database(_) => ErrorKind::ProcessingError,
        }
    }

    /// Conflicts and lock timeouts are safe to resubmit unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }

    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            LedgerError::AccountFrozen { .. } => Some("wait for the freeze to expire or contact support"),
            LedgerError::AccountNotActive { .. } => Some("complete account verification or contact support"),
            LedgerError::InsufficientBalance { .. } => Some("deposit funds before retrying"),
            LedgerError::InsufficientCredits { .. } => Some("purchase more credits"),
            LedgerError::UnknownPackage(_) => Some("choose one of the listed credit packages"),
            LedgerError::LimitExceeded { .. } => Some("reduce amount below the remaining limit"),
            LedgerError::DuplicateAccount { .. } => Some("use the existing account"),
            LedgerError::Conflict(_) => Some("retry the request"),
            LedgerError::FraudBlocked { .. } => Some("contact support to review the transaction"),
            _ => None,
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            LedgerError::AccountFrozen { reason, until } => json!({
                "reason": reason,
                "frozen_until": until,
            }),
            LedgerError::AccountNotActive { status } => json!({ "status": status }),
            LedgerError::InsufficientBalance { required, available } => json!({
                "required": required.to_string(),
                "available": available.to_string(),
                "shortfall": (required - available).to_string(),
            }),
            LedgerError::InsufficientCredits {
                required,
                available,
                shortfall,
            } => json!({
                "required": required,
                "available": available,
                "shortfall": shortfall,
            }),
            LedgerError::FraudBlocked {
                transaction_id,
                risk_score,
                risk_tier,
                ..
            } => json!({
                "transaction_id": transaction_id,
                "risk_score": risk_score,
                "risk_tier": risk_tier,
            }),
            LedgerError::LimitExceeded {
                window,
                limit,
                spent,
                requested,
                remaining,
            } => json!({
                "window": window,
                "limit": limit.to_string(),
                "spent": spent.to_string(),
                "requested": requested.to_string(),
                "remaining": remaining.to_string(),
            }),
            LedgerError::Processing { transaction_id, .. } => json!({ "transaction_id": transaction_id }),
            _ => serde_json::Value::Null,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            LedgerError::Database(e) => {
                tracing::error!("Database error surfaced to caller: {}", e);
                "Internal storage error".to_string()
            }
            other => other.to_string(),
        };

        ErrorBody {
            kind: self.kind(),
            message,
            details: self.details(),
            remediation: self.remediation(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
