pub mod profiles;

use chrono::Duration;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

use crate::domain::VerificationTier;
use crate::services::fraud::FraudPolicy;
use profiles::{Profile, ProfileDefaults};

/// Business knobs shared by the account service, processor and maintenance run.
#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    /// Tier assigned to newly opened accounts.
    pub default_verification_tier: VerificationTier,
    pub fraud: FraudPolicy,
    pub lock_timeout: std::time::Duration,
    /// Failed-attempt count at which an account is frozen automatically.
    pub auto_freeze_after_failures: i32,
    pub auto_freeze_duration: Duration,
    /// Age after which FAILED rows expire and PENDING rows are abandoned.
    pub failed_tx_expiry: Duration,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            default_verification_tier: VerificationTier::Basic,
            fraud: FraudPolicy::default(),
            lock_timeout: std::time::Duration::from_millis(5_000),
            auto_freeze_after_failures: 5,
            auto_freeze_duration: Duration::hours(24),
            failed_tx_expiry: Duration::hours(72),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub db_max_connections: u32,
    pub maintenance_schedule: String,
    pub credit_refill_schedule: String,
    pub policy: LedgerPolicy,
}

#[derive(Debug)]
pub struct ConfigInfo {
    pub config: Config,
    pub profile: Profile,
    pub overrides: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<ConfigInfo> {
        dotenv().ok();
        Self::from_lookup(Profile::from_env(), |key| env::var(key).ok())
    }

    /// Resolves every setting through `lookup`, falling back to the profile
    /// defaults. Keys that were found are reported as overrides.
    pub fn from_lookup<F>(profile: Profile, lookup: F) -> anyhow::Result<ConfigInfo>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ProfileDefaults::for_profile(profile);
        let policy_defaults = LedgerPolicy::default();
        let mut overrides = Vec::new();

        let mut read = |key: &str| {
            let value = lookup(key);
            if value.is_some() {
                overrides.push(key.to_string());
            }
            value
        };

        let database_url = read("DATABASE_URL")
            .or(defaults.database_url)
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let redis_url = read("REDIS_URL").or(defaults.redis_url).filter(|url| !url.is_empty());

        let db_max_connections = parse_or(read("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS", defaults.db_max_connections)?;

        let maintenance_schedule = read("MAINTENANCE_SCHEDULE").unwrap_or(defaults.maintenance_schedule);
        let credit_refill_schedule = read("CREDIT_REFILL_SCHEDULE").unwrap_or(defaults.credit_refill_schedule);

        let default_verification_tier = parse_or(
            read("DEFAULT_VERIFICATION_TIER"),
            "DEFAULT_VERIFICATION_TIER",
            policy_defaults.default_verification_tier,
        )?;

        let mut fraud = policy_defaults.fraud.clone();
        fraud.pass_threshold = parse_or(read("FRAUD_PASS_THRESHOLD"), "FRAUD_PASS_THRESHOLD", fraud.pass_threshold)?;
        if !(1..=100).contains(&fraud.pass_threshold) {
            anyhow::bail!("FRAUD_PASS_THRESHOLD must be between 1 and 100");
        }

        let expiry_hours: i64 = parse_or(read("FAILED_TX_EXPIRY_HOURS"), "FAILED_TX_EXPIRY_HOURS", 72)?;
        let lock_timeout_ms: u64 = parse_or(read("LOCK_TIMEOUT_MS"), "LOCK_TIMEOUT_MS", defaults.lock_timeout_ms)?;
        let auto_freeze_after_failures = parse_or(
            read("AUTO_FREEZE_AFTER_FAILURES"),
            "AUTO_FREEZE_AFTER_FAILURES",
            policy_defaults.auto_freeze_after_failures,
        )?;
        let auto_freeze_hours: i64 = parse_or(read("AUTO_FREEZE_HOURS"), "AUTO_FREEZE_HOURS", 24)?;

        Ok(ConfigInfo {
            config: Config {
                database_url,
                redis_url,
                db_max_connections,
                maintenance_schedule,
                credit_refill_schedule,
                policy: LedgerPolicy {
                    default_verification_tier,
                    fraud,
                    lock_timeout: std::time::Duration::from_millis(lock_timeout_ms),
                    auto_freeze_after_failures,
                    auto_freeze_duration: Duration::hours(auto_freeze_hours),
                    failed_tx_expiry: Duration::hours(expiry_hours),
                },
            },
            profile,
            overrides,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_development_defaults() {
        let info = Config::from_lookup(Profile::Development, lookup(&[])).unwrap();
        assert!(info.overrides.is_empty());
        assert!(info.config.redis_url.is_none());
        assert_eq!(info.config.policy.fraud.pass_threshold, 70);
        assert_eq!(info.config.policy.failed_tx_expiry, Duration::hours(72));
        assert_eq!(info.config.policy.default_verification_tier, VerificationTier::Basic);
    }

    #[test]
    fn test_production_requires_database_url() {
        assert!(Config::from_lookup(Profile::Production, lookup(&[])).is_err());
    }

    #[test]
    fn test_overrides_are_reported() {
        let info = Config::from_lookup(
            Profile::Production,
            lookup(&[
                ("DATABASE_URL", "postgres://u:p@db/ledger"),
                ("FRAUD_PASS_THRESHOLD", "60"),
                ("DEFAULT_VERIFICATION_TIER", "standard"),
                ("AUTO_FREEZE_HOURS", "12"),
            ]),
        )
        .unwrap();

        assert_eq!(info.config.policy.fraud.pass_threshold, 60);
        assert_eq!(info.config.policy.default_verification_tier, VerificationTier::Standard);
        assert_eq!(info.config.policy.auto_freeze_duration, Duration::hours(12));
        assert!(info.overrides.contains(&"FRAUD_PASS_THRESHOLD".to_string()));
        assert_eq!(info.overrides.len(), 4);
    }

    #[test]
    fn test_rejects_garbage_numbers() {
        let err = Config::from_lookup(Profile::Development, lookup(&[("LOCK_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("LOCK_TIMEOUT_MS"));
    }
}
