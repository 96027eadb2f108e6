//! Framework-agnostic ledger entities.

/// Stable upper-case string form for persisted enums.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

pub mod account;
pub mod credit;
pub mod risk;
pub mod tier;
pub mod transaction;

pub use account::{Account, AccountStatus};
pub use credit::{credit_packages, find_package, CreditPackage, CreditTier, UserCredits, CHAT_CREDIT_COST};
pub use risk::{FraudAssessment, RiskAnalysis, RiskCategory, RiskFactor, RiskTier};
pub use tier::{TierLimits, VerificationTier, TIER_LIMITS_VERSION};
pub use transaction::{
    CreditMovement, NewTransaction, PaymentMethod, Transaction, TransactionCategory, TransactionStatus,
    TransactionType,
};
