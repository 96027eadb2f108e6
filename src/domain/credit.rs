//! Usage credits: the per-user counter, its tier ceiling and the package catalog.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Credits consumed by one chat interaction.
pub const CHAT_CREDIT_COST: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditTier {
    Basic,
    Standard,
    Premium,
    Enterprise,
}

string_enum!(CreditTier {
    Basic => "BASIC",
    Standard => "STANDARD",
    Premium => "PREMIUM",
    Enterprise => "ENTERPRISE",
});

impl CreditTier {
    pub fn ceiling(&self) -> i64 {
        match self {
            CreditTier::Basic => 50,
            CreditTier::Standard => 200,
            CreditTier::Premium => 500,
            CreditTier::Enterprise => 1_000,
        }
    }

    /// Balance granted at registration.
    pub fn registration_default(&self) -> i64 {
        match self {
            CreditTier::Basic => 20,
            CreditTier::Standard => 50,
            CreditTier::Premium => 100,
            CreditTier::Enterprise => 200,
        }
    }
}

/// Credit counter as stored on the user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredits {
    pub user_id: Uuid,
    pub credits: i64,
    pub tier: CreditTier,
}

impl UserCredits {
    pub fn registered(user_id: Uuid, tier: CreditTier) -> Self {
        Self {
            user_id,
            credits: tier.registration_default(),
            tier,
        }
    }

    pub fn ceiling(&self) -> i64 {
        self.tier.ceiling()
    }

    pub fn headroom(&self) -> i64 {
        (self.ceiling() - self.credits).max(0)
    }

    pub fn is_at_ceiling(&self) -> bool {
        self.credits >= self.ceiling()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditPackage {
    pub id: &'static str,
    pub credits: i64,
    pub price_cents: i64,
    pub description: &'static str,
}

impl CreditPackage {
    pub fn price(&self) -> BigDecimal {
        BigDecimal::new(self.price_cents.into(), 2)
    }
}

const CATALOG: [CreditPackage; 4] = [
    CreditPackage {
        id: "basic",
        credits: 50,
        price_cents: 499,
        description: "50 chat credits",
    },
    CreditPackage {
        id: "standard",
        credits: 150,
        price_cents: 1_299,
        description: "150 chat credits",
    },
    CreditPackage {
        id: "premium",
        credits: 350,
        price_cents: 2_499,
        description: "350 chat credits",
    },
    CreditPackage {
        id: "enterprise",
        credits: 500,
        price_cents: 3_999,
        description: "500 chat credits",
    },
];

pub fn credit_packages() -> &'static [CreditPackage] {
    &CATALOG
}

pub fn find_package(id: &str) -> Option<&'static CreditPackage> {
    CATALOG.iter().find(|p| p.id.eq_ignore_ascii_case(id.trim()))
}
