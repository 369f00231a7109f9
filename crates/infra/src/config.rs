//! Runtime configuration read from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TALLY_CONFLICT_RETRIES` | `5` |
//! | `TALLY_FREE_MONTHLY_INVOICES` | `5` |
//! | `TALLY_FREE_ACTIVE_CLIENTS` | `2` |
//! | `TALLY_PRICE_PRO` | unset |
//! | `TALLY_PRICE_BUSINESS` | unset |
//! | `TALLY_USE_POSTGRES` | `false` |
//! | `DATABASE_URL` | required when `TALLY_USE_POSTGRES=true` |

use core::str::FromStr;

use thiserror::Error;

use tally_billing::{PlanCatalog, PriceBook};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyConfig {
    /// Attempts for operations retried on optimistic concurrency conflicts.
    pub conflict_retries: u32,
    pub plans: PlanCatalog,
    pub prices: PriceBook,
    pub use_postgres: bool,
    pub database_url: Option<String>,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 5,
            plans: PlanCatalog::default(),
            prices: PriceBook::default(),
            use_postgres: false,
            database_url: None,
        }
    }
}

impl TallyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let conflict_retries = parse_or(&non_empty, "TALLY_CONFLICT_RETRIES", defaults.conflict_retries)?;
        if conflict_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "TALLY_CONFLICT_RETRIES",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        let plans = PlanCatalog {
            free_monthly_invoices: parse_or(
                &non_empty,
                "TALLY_FREE_MONTHLY_INVOICES",
                defaults.plans.free_monthly_invoices,
            )?,
            free_active_clients: parse_or(
                &non_empty,
                "TALLY_FREE_ACTIVE_CLIENTS",
                defaults.plans.free_active_clients,
            )?,
        };

        let prices = PriceBook {
            pro_price_id: non_empty("TALLY_PRICE_PRO").map(|v| v.trim().to_string()),
            business_price_id: non_empty("TALLY_PRICE_BUSINESS").map(|v| v.trim().to_string()),
        };

        let use_postgres = parse_or(&non_empty, "TALLY_USE_POSTGRES", false)?;
        let database_url = non_empty("DATABASE_URL");
        if use_postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            conflict_retries,
            plans,
            prices,
            use_postgres,
            database_url,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
