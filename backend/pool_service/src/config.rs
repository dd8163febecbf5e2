//! Application configuration loaded from environment variables.

use crate::errors::{PoolError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// ISO currency code every event is denominated in
    pub currency: String,
    /// Stripe secret key; the sandbox gateway is used when absent
    pub stripe_secret_key: Option<String>,
    /// Base URL of the Stripe REST API
    pub stripe_api_base: String,
    /// Request timeout for payment provider calls, in seconds
    pub gateway_timeout_secs: u64,
    /// Optimistic-write attempts before giving up with `ConcurrencyExhausted`
    pub max_apply_attempts: u32,
    /// How often (in seconds) the background reconciler runs
    pub reconcile_interval_secs: u64,
    /// Age (in seconds) after which a pending contribution is re-checked
    pub stale_pending_secs: i64,
    /// Optional endpoint receiving notification records as JSON
    pub notify_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./giftpool.db".to_string()),
            api_port: parse_var("API_PORT", "3002")?,
            currency: env_var("POOL_CURRENCY")
                .unwrap_or_else(|_| "usd".to_string())
                .to_ascii_lowercase(),
            stripe_secret_key: env_var("STRIPE_SECRET_KEY").ok().filter(|k| !k.is_empty()),
            stripe_api_base: env_var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            gateway_timeout_secs: parse_var("GATEWAY_TIMEOUT_SECS", "30")?,
            max_apply_attempts: parse_var("MAX_APPLY_ATTEMPTS", "5")?,
            reconcile_interval_secs: parse_var("RECONCILE_INTERVAL_SECS", "30")?,
            stale_pending_secs: parse_var("STALE_PENDING_SECS", "900")?,
            notify_webhook_url: env_var("NOTIFY_WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
        })
        .and_then(Config::validated)
    }

    fn validated(self) -> Result<Self> {
        if self.max_apply_attempts == 0 {
            return Err(PoolError::Config(
                "MAX_APPLY_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.currency.len() != 3 {
            return Err(PoolError::Config(format!(
                "Invalid POOL_CURRENCY: {}",
                self.currency
            )));
        }
        Ok(self)
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 3002,
            currency: "usd".to_string(),
            stripe_secret_key: None,
            stripe_api_base: "https://api.stripe.com".to_string(),
            gateway_timeout_secs: 30,
            max_apply_attempts: 5,
            reconcile_interval_secs: 30,
            stale_pending_secs: 900,
            notify_webhook_url: None,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| PoolError::Config(format!("Missing env var: {key}")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| PoolError::Config(format!("Invalid {key}")))
}
