pub mod escalation;
pub mod reconcile;
pub mod trailing;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::time::Duration;

use crate::db::PositionStore;
use crate::errors::ExchangeError;
use crate::exchange::{ExchangeClient, PriceCache, RetryPolicy};
use crate::models::{Position, PositionStatus};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_stop_percent: Decimal,
    /// Emergency trigger as a fraction of the stop price, in (0, 1).
    pub emergency_ratio: Decimal,
    /// Positions younger than this are skipped; the buy may not have settled.
    pub grace_window_secs: i64,
    /// Exchange lot floor; a sellable quantity below it trips the
    /// starvation guard.
    pub min_lot: Decimal,
    /// Cap sell quantity at the live exchange balance instead of trusting
    /// the recorded quantity.
    pub use_live_balance: bool,
    /// Tolerated fraction of the recorded quantity before reconciliation
    /// declares the balance unattainable.
    pub balance_slack: Decimal,
    /// Pause after a cancel so the exchange releases the reserved balance
    /// before the next order is placed.
    pub cancel_release_delay: Duration,
    /// Closed-order lookback when the ledger is empty.
    pub sync_lookback_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_stop_percent: dec!(4),
            emergency_ratio: dec!(0.95),
            grace_window_secs: 120,
            min_lot: dec!(0.0001),
            use_live_balance: true,
            balance_slack: dec!(0.9),
            cancel_release_delay: Duration::from_secs(2),
            sync_lookback_days: 7,
        }
    }
}

/// Outcome of cancelling a resting order: the cancel can race a fill, and a
/// filled order must be finalized, never discarded.
#[derive(Debug)]
pub(crate) enum CancelOutcome {
    Cancelled,
    AlreadyFilled(crate::models::OrderStatus),
}

/// Position lifecycle engine. Drives the escalation state machine
/// ([`escalation`]) and the reconciliation sweep ([`reconcile`]) over a
/// claimed set of positions.
pub struct Engine<S, E> {
    store: S,
    exchange: E,
    retry: RetryPolicy,
    prices: PriceCache,
    config: EngineConfig,
}

impl<S, E> Engine<S, E> {
    pub fn new(
        store: S,
        exchange: E,
        retry: RetryPolicy,
        prices: PriceCache,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            exchange,
            retry,
            prices,
            config,
        }
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn exchange(&self) -> &E {
        &self.exchange
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<S, E> Engine<S, E>
where
    S: PositionStore,
    E: ExchangeClient,
{
    /// Current price for the pair, served from the TTL cache when fresh.
    pub(crate) async fn cached_price(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        if let Some(price) = self.prices.get(pair) {
            return Ok(price);
        }
        let exchange = &self.exchange;
        let price = self.retry.run(|| exchange.get_price(pair)).await?;
        self.prices.put(pair, price);
        Ok(price)
    }

    pub(crate) async fn fetch_balances(
        &self,
    ) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let exchange = &self.exchange;
        self.retry.run(|| exchange.get_balances()).await
    }

    /// Quantity we can actually sell: the recorded quantity, capped by the
    /// live base-asset balance when configured.
    pub(crate) fn sellable_quantity(
        &self,
        position: &Position,
        balances: &HashMap<String, Decimal>,
    ) -> Decimal {
        if !self.config.use_live_balance {
            return position.quantity;
        }
        let live = balances
            .get(position.base_asset())
            .copied()
            .unwrap_or(Decimal::ZERO);
        position.quantity.min(live)
    }

    /// Cancel an order and confirm the exchange-side outcome. A permanent
    /// rejection of the cancel usually means the order already left the
    /// book, so the status query decides.
    pub(crate) async fn cancel_and_confirm(
        &self,
        order_id: &str,
    ) -> Result<CancelOutcome, ExchangeError> {
        let exchange = &self.exchange;

        match self.retry.run(|| exchange.cancel_order(order_id)).await {
            Ok(()) => {}
            Err(e) if !e.is_transient() => {
                tracing::warn!(order_id, error = %e, "Cancel rejected — verifying order status");
            }
            Err(e) => return Err(e),
        }

        let status = self.retry.run(|| exchange.order_status(order_id)).await?;
        if status.is_filled() {
            Ok(CancelOutcome::AlreadyFilled(status))
        } else {
            Ok(CancelOutcome::Cancelled)
        }
    }

    /// Transition a position to `completed`, recording the sell price, the
    /// accumulated fee and the fee-adjusted profit percentage.
    pub(crate) async fn finalize_completed(
        &self,
        position: &mut Position,
        fill_price: Decimal,
        sell_fee: Option<Decimal>,
    ) -> anyhow::Result<()> {
        let total_fee = match (position.fee_eur, sell_fee) {
            (Some(prior), Some(fee)) => Some(prior + fee),
            (prior, fee) => prior.or(fee),
        };

        position.sell_price = Some(fill_price);
        position.fee_eur = total_fee;
        position.profit_percent = Some(profit_percent(
            position.buy_price,
            fill_price,
            total_fee,
            position.quantity,
        ));
        position.status = PositionStatus::Completed;
        position.pending_order_id = None;
        position.updated_at = Utc::now();

        self.store.update(position).await?;

        tracing::info!(
            pair = %position.pair,
            buy_price = %position.buy_price,
            sell_price = %fill_price,
            profit_percent = %position.profit_percent.unwrap_or_default(),
            "Position completed"
        );
        Ok(())
    }
}

/// `(sell − buy) / buy × 100`, reduced by the fee expressed as a percentage
/// of the position's cost where fee data is available. Rounded to 2 dp.
pub(crate) fn profit_percent(
    buy_price: Decimal,
    sell_price: Decimal,
    fee: Option<Decimal>,
    quantity: Decimal,
) -> Decimal {
    if buy_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let gross = (sell_price - buy_price) / buy_price * dec!(100);
    let fee_pct = match fee {
        Some(fee) if quantity > Decimal::ZERO => fee / (buy_price * quantity) * dec!(100),
        _ => Decimal::ZERO,
    };
    (gross - fee_pct).round_dp(2)
}
