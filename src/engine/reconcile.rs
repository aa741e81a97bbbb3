//! Reconciliation sweep: the idempotent backstop that keeps the ledger
//! consistent with the exchange's authoritative order and balance state.
//!
//! Safe to run concurrently with the escalation tick — both claim positions
//! under the same skip-locked discipline — and safe to re-run from scratch:
//! every pass re-checks exchange state before mutating anything, and the buy
//! import dedups on the exchange order id.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::Engine;
use crate::db::PositionStore;
use crate::exchange::ExchangeClient;
use crate::models::{OrderState, Position, PositionStatus, Side};

impl<S, E> Engine<S, E>
where
    S: PositionStore,
    E: ExchangeClient,
{
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let mut positions = self.store().claim_active().await?;
        tracing::info!(claimed = positions.len(), "Reconciliation sweep started");

        for pos in &mut positions {
            if let Err(e) = self.backstop_pending_order(pos).await {
                tracing::error!(pair = %pos.pair, error = %e, "Reconciliation: fill backstop failed");
            }
        }

        if let Err(e) = self.import_unseen_buys().await {
            tracing::error!(error = %e, "Reconciliation: buy import failed");
        }

        if let Err(e) = self.validate_balances(&mut positions).await {
            tracing::error!(error = %e, "Reconciliation: balance validation failed");
        }

        for pos in &positions {
            if let Err(e) = self.store().release(pos.id).await {
                tracing::error!(position_id = %pos.id, error = %e, "Failed to release claim");
            }
        }

        tracing::info!("Reconciliation sweep finished");
        Ok(())
    }

    /// Backstop for fills the escalation loop missed (e.g. across a
    /// restart): query every pending order directly and finalize or repair.
    async fn backstop_pending_order(&self, pos: &mut Position) -> anyhow::Result<()> {
        let Some(order_id) = pos.pending_order_id.clone() else {
            return Ok(());
        };

        let exchange = self.exchange();
        let status = match self.retry().run(|| exchange.order_status(&order_id)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    pair = %pos.pair,
                    order_id = %order_id,
                    error = %e,
                    "Reconciliation: order status lookup failed — deferring"
                );
                return Ok(());
            }
        };

        match status.state {
            OrderState::Closed if status.is_filled() => {
                tracing::info!(
                    pair = %pos.pair,
                    order_id = %order_id,
                    "Reconciliation: pending order filled — finalizing"
                );
                let fill = status.fill_price.unwrap_or(pos.buy_price);
                self.finalize_completed(pos, fill, status.fee).await?;
            }
            OrderState::Cancelled | OrderState::Closed => {
                // Cancelled behind our back or closed with zero volume: the
                // pointer is dangling. Repair it so the position is
                // serviceable again.
                tracing::warn!(
                    pair = %pos.pair,
                    order_id = %order_id,
                    state = ?status.state,
                    "Reconciliation: pending order gone — reverting to active"
                );
                pos.status = PositionStatus::Active;
                pos.pending_order_id = None;
                pos.updated_at = Utc::now();
                self.store().update(pos).await?;
            }
            OrderState::Open => {}
        }

        Ok(())
    }

    /// Insert positions for closed buy fills the ledger has never seen,
    /// e.g. when a signal handler crashed after the buy executed but before
    /// the row landed. Dedup key is the exchange order id.
    async fn import_unseen_buys(&self) -> anyhow::Result<()> {
        let since = match self.store().last_created_at().await? {
            Some(ts) => ts,
            None => Utc::now() - chrono::Duration::days(self.config().sync_lookback_days),
        };

        let exchange = self.exchange();
        let closed = self
            .retry()
            .run(|| exchange.closed_orders_since(since))
            .await?;

        for order in closed {
            if order.side != Side::Buy || order.fill_quantity <= Decimal::ZERO {
                continue;
            }
            if self.store().has_source_order(&order.order_id).await? {
                continue;
            }

            let mut pos = Position::new(
                &order.pair,
                order.fill_quantity,
                order.fill_price,
                self.config().default_stop_percent,
            );
            pos.source_order_id = Some(order.order_id.clone());
            pos.fee_eur = Some(order.fee);

            self.store().insert(&pos).await?;
            tracing::info!(
                pair = %pos.pair,
                order_id = %order.order_id,
                quantity = %order.fill_quantity,
                buy_price = %order.fill_price,
                "Reconciliation: imported buy fill with no local position"
            );
        }

        Ok(())
    }

    /// Compare aggregate recorded quantity per base asset against the live
    /// balance; positions whose funds are demonstrably gone are marked
    /// failed instead of being left silently stuck. Positions with a pending
    /// limit sell are exempt — their balance is held by the order.
    async fn validate_balances(&self, positions: &mut [Position]) -> anyhow::Result<()> {
        let balances = match self.fetch_balances().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "Reconciliation: balance lookup failed — deferring");
                return Ok(());
            }
        };

        let mut required: HashMap<String, Decimal> = HashMap::new();
        for pos in positions.iter() {
            if pos.status == PositionStatus::Active && pos.pending_order_id.is_none() {
                *required.entry(pos.base_asset().to_string()).or_default() += pos.quantity;
            }
        }

        for pos in positions.iter_mut() {
            if pos.status != PositionStatus::Active || pos.pending_order_id.is_some() {
                continue;
            }

            let asset = pos.base_asset().to_string();
            let Some(total) = required.get(&asset).copied() else {
                continue;
            };
            let live = balances.get(&asset).copied().unwrap_or(Decimal::ZERO);

            if live < total * self.config().balance_slack {
                tracing::warn!(
                    pair = %pos.pair,
                    required = %total,
                    available = %live,
                    "Reconciliation: ledger quantity unattainable — marking failed"
                );
                pos.status = PositionStatus::Failed;
                pos.error = Some(format!(
                    "insufficient {asset} balance: {live} available, {total} recorded"
                ));
                pos.updated_at = Utc::now();
                self.store().update(pos).await?;
            }
        }

        Ok(())
    }
}
