use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::exchange::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,

    // Kraken API credentials
    pub kraken_api_key: String,
    pub kraken_api_secret: String,

    // Scheduler cadence
    pub trade_interval_secs: u64,
    pub sync_interval_secs: u64,

    // Trailing stop parameters
    pub default_stop_percent: Decimal,
    pub emergency_ratio: Decimal,
    pub grace_window_secs: i64,

    // Quantity resolution
    pub min_lot: Decimal,
    pub use_live_balance: bool,
    pub balance_slack: Decimal,

    // Exchange call plumbing
    pub price_cache_ttl_secs: u64,
    pub cancel_release_delay_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_factor: u32,

    // Store claiming
    pub claim_ttl_secs: i64,
    pub sync_lookback_days: i64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,

            kraken_api_key: env::var("KRAKEN_API_KEY")
                .map_err(|_| anyhow::anyhow!("KRAKEN_API_KEY must be set"))?,
            kraken_api_secret: env::var("KRAKEN_API_SECRET")
                .map_err(|_| anyhow::anyhow!("KRAKEN_API_SECRET must be set"))?,

            trade_interval_secs: parse_or("TRADE_INTERVAL_SECS", 180),
            sync_interval_secs: parse_or("SYNC_INTERVAL_SECS", 900),

            default_stop_percent: parse_or("DEFAULT_STOP_PERCENT", dec!(4)),
            emergency_ratio: parse_or("EMERGENCY_RATIO", dec!(0.95)),
            grace_window_secs: parse_or("GRACE_WINDOW_SECS", 120),

            min_lot: parse_or("MIN_LOT", dec!(0.0001)),
            use_live_balance: parse_or("USE_LIVE_BALANCE", true),
            balance_slack: parse_or("BALANCE_SLACK", dec!(0.9)),

            price_cache_ttl_secs: parse_or("PRICE_CACHE_TTL_SECS", 60),
            cancel_release_delay_ms: parse_or("CANCEL_RELEASE_DELAY_MS", 2000),
            retry_max_attempts: parse_or("RETRY_MAX_ATTEMPTS", 3),
            retry_initial_delay_ms: parse_or("RETRY_INITIAL_DELAY_MS", 1000),
            retry_factor: parse_or("RETRY_FACTOR", 2),

            claim_ttl_secs: parse_or("CLAIM_TTL_SECS", 600),
            sync_lookback_days: parse_or("SYNC_LOOKBACK_DAYS", 7),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.emergency_ratio <= Decimal::ZERO || self.emergency_ratio >= Decimal::ONE {
            anyhow::bail!(
                "EMERGENCY_RATIO must be in (0, 1), got {}",
                self.emergency_ratio
            );
        }
        if self.default_stop_percent <= Decimal::ZERO || self.default_stop_percent >= dec!(100) {
            anyhow::bail!(
                "DEFAULT_STOP_PERCENT must be in (0, 100), got {}",
                self.default_stop_percent
            );
        }
        if self.balance_slack <= Decimal::ZERO || self.balance_slack > Decimal::ONE {
            anyhow::bail!("BALANCE_SLACK must be in (0, 1], got {}", self.balance_slack);
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_stop_percent: self.default_stop_percent,
            emergency_ratio: self.emergency_ratio,
            grace_window_secs: self.grace_window_secs,
            min_lot: self.min_lot,
            use_live_balance: self.use_live_balance,
            balance_slack: self.balance_slack,
            cancel_release_delay: Duration::from_millis(self.cancel_release_delay_ms),
            sync_lookback_days: self.sync_lookback_days,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            factor: self.retry_factor,
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
