pub mod kraken;
pub mod price_cache;
pub mod retry;

pub use kraken::KrakenClient;
pub use price_cache::PriceCache;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::errors::ExchangeError;
use crate::models::{ClosedOrder, OrderStatus};

/// Everything the engine needs from the exchange. All calls may fail
/// transiently (rate limit, network) or permanently (unknown pair, rejected
/// order); see [`ExchangeError`].
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Last trade price for the pair.
    async fn get_price(&self, pair: &str) -> Result<Decimal, ExchangeError>;

    /// Account balances keyed by normalized asset code.
    async fn get_balances(&self) -> Result<HashMap<String, Decimal>, ExchangeError>;

    /// Place a market sell; returns the exchange order id.
    async fn place_market_sell(
        &self,
        pair: &str,
        quantity: Decimal,
    ) -> Result<String, ExchangeError>;

    /// Place a limit sell; returns the exchange order id.
    async fn place_limit_sell(
        &self,
        pair: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, ExchangeError>;

    /// Closed orders since the given timestamp, newest state included.
    async fn closed_orders_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClosedOrder>, ExchangeError>;
}
