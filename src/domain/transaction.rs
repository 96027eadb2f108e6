//! Transaction domain entity.
//! Append-oriented record of one attempted monetary operation against an account.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::risk::{FraudAssessment, RiskTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    CreditPurchase,
    Withdrawal,
    Refund,
    Adjustment,
}

string_enum!(TransactionType {
    Deposit => "DEPOSIT",
    CreditPurchase => "CREDIT_PURCHASE",
    Withdrawal => "WITHDRAWAL",
    Refund => "REFUND",
    Adjustment => "ADJUSTMENT",
});

impl TransactionType {
    /// Whether this type moves money into the account.
    pub fn is_inflow(&self) -> bool {
        matches!(self, TransactionType::Deposit | TransactionType::Refund)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionCategory {
    AccountFunding,
    ServicePurchase,
    Payout,
    Correction,
}

string_enum!(TransactionCategory {
    AccountFunding => "ACCOUNT_FUNDING",
    ServicePurchase => "SERVICE_PURCHASE",
    Payout => "PAYOUT",
    Correction => "CORRECTION",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    BankTransfer,
    DigitalWallet,
    AccountBalance,
}

string_enum!(PaymentMethod {
    CreditCard => "CREDIT_CARD",
    DebitCard => "DEBIT_CARD",
    BankTransfer => "BANK_TRANSFER",
    DigitalWallet => "DIGITAL_WALLET",
    AccountBalance => "ACCOUNT_BALANCE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

string_enum!(TransactionStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Expired => "EXPIRED",
});

impl TransactionStatus {
    /// `PENDING -> COMPLETED | FAILED`, `FAILED -> EXPIRED`. Nothing else.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Pending, TransactionStatus::Completed)
                | (TransactionStatus::Pending, TransactionStatus::Failed)
                | (TransactionStatus::Failed, TransactionStatus::Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// Credit side of a purchase, filled in once the package is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditMovement {
    pub package_id: String,
    pub credits_purchased: i64,
    pub credit_balance_before: i64,
    pub credit_balance_after: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub account_id: Uuid,
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub category: TransactionCategory,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub amount: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub credits: Option<CreditMovement>,
    pub status: TransactionStatus,
    pub description: Option<String>,

    pub risk_score: Option<i32>,
    pub risk_tier: Option<RiskTier>,
    pub fraud_check_passed: Option<bool>,
    pub fraud_reason: Option<String>,
    pub risk_analysis: Option<serde_json::Value>,

    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub failure_reason: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to open a pending transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: String,
    pub account_id: Uuid,
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub category: TransactionCategory,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub amount: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub credits: Option<CreditMovement>,
    pub description: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Transaction {
    pub fn pending(new: NewTransaction, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            account_id: new.account_id,
            user_id: new.user_id,
            transaction_type: new.transaction_type,
            category: new.category,
            payment_method: new.payment_method,
            currency: new.currency,
            amount: new.amount,
            balance_before: new.balance_before,
            balance_after: new.balance_after,
            credits: new.credits,
            status: TransactionStatus::Pending,
            description: new.description,
            risk_score: None,
            risk_tier: None,
            fraud_check_passed: None,
            fraud_reason: None,
            risk_analysis: None,
            ip_address: new.ip_address,
            user_agent: new.user_agent,
            failure_reason: None,
            retry_count: 0,
            created_at: now,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            updated_at: now,
        }
    }

    pub fn attach_assessment(&mut self, assessment: &FraudAssessment, now: DateTime<Utc>) {
        self.risk_score = Some(assessment.risk_score);
        self.risk_tier = Some(assessment.risk_tier);
        self.fraud_check_passed = Some(assessment.passed);
        self.fraud_reason = assessment.reason.clone();
        self.risk_analysis = serde_json::to_value(&assessment.analysis).ok();
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    fn transition(&mut self, next: TransactionStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "transaction {} cannot move from {} to {}",
                self.id, self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), String> {
        self.transition(TransactionStatus::Completed)?;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), String> {
        self.transition(TransactionStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        self.failed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), String> {
        self.transition(TransactionStatus::Expired)?;
        self.updated_at = now;
        Ok(())
    }

    /// Signed effect on the account balance.
    pub fn balance_delta(&self) -> BigDecimal {
        &self.balance_after - &self.balance_before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn new_deposit(amount: &str) -> NewTransaction {
        let amount = BigDecimal::from_str(amount).unwrap();
        NewTransaction {
            id: "TXN00000000000000000001".to_string(),
            account_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            transaction_type: TransactionType::Deposit,
            category: TransactionCategory::AccountFunding,
            payment_method: PaymentMethod::CreditCard,
            currency: "USD".to_string(),
            balance_before: BigDecimal::from(0),
            balance_after: amount.clone(),
            amount,
            credits: None,
            description: Some("top-up".to_string()),
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: None,
        }
    }

    #[test]
    fn test_transaction_pending() {
        let now = Utc::now();
        let tx = Transaction::pending(new_deposit("100.50"), now);

        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.amount, BigDecimal::from_str("100.50").unwrap());
        assert_eq!(tx.balance_delta(), tx.amount);
        assert_eq!(tx.created_at, now);
        assert!(tx.completed_at.is_none());
        assert!(tx.risk_score.is_none());
    }

    #[test]
    fn test_completed_is_terminal() {
        let now = Utc::now();
        let mut tx = Transaction::pending(new_deposit("10"), now);
        tx.mark_completed(now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert!(tx.mark_failed("late", now).is_err());
        assert!(tx.mark_expired(now).is_err());
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn test_failed_then_expired() {
        let now = Utc::now();
        let mut tx = Transaction::pending(new_deposit("10"), now);
        tx.mark_failed("card declined", now).unwrap();
        assert_eq!(tx.failure_reason.as_deref(), Some("card declined"));
        assert_eq!(tx.failed_at, Some(now));
        tx.mark_expired(now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Expired);
        assert!(tx.mark_completed(now).is_err());
    }

    #[test]
    fn test_pending_cannot_expire_directly() {
        assert!(!TransactionStatus::Pending.can_transition_to(TransactionStatus::Expired));
        assert!(!TransactionStatus::Expired.can_transition_to(TransactionStatus::Failed));
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(!TransactionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_enum_strings_parse_back() {
        assert_eq!("CREDIT_PURCHASE".parse::<TransactionType>().unwrap(), TransactionType::CreditPurchase);
        assert_eq!("BANK_TRANSFER".parse::<PaymentMethod>().unwrap(), PaymentMethod::BankTransfer);
        assert_eq!("EXPIRED".parse::<TransactionStatus>().unwrap(), TransactionStatus::Expired);
        assert!("deposit".parse::<TransactionType>().is_err());
        assert!(TransactionType::Refund.is_inflow());
        assert!(!TransactionType::CreditPurchase.is_inflow());
    }
}
