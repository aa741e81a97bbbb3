//! Per-tick order escalation state machine.
//!
//! For each claimed position, evaluated in order: recency guard, high-water
//! ratchet, fill check, limit-order escalation, emergency market sell,
//! starvation guard. No state transition is persisted on a failed or
//! unconfirmed exchange call; the next tick re-evaluates from durable state.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::{trailing, CancelOutcome, Engine};
use crate::db::PositionStore;
use crate::exchange::ExchangeClient;
use crate::models::{Position, PositionStatus};

impl<S, E> Engine<S, E>
where
    S: PositionStore,
    E: ExchangeClient,
{
    /// One escalation tick: claim live positions, fetch prices and balances,
    /// run the state machine per position, release every claim.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let positions = self.store().claim_active().await?;
        if positions.is_empty() {
            tracing::debug!("Escalation tick: no live positions");
            return Ok(());
        }

        let balances = match self.fetch_balances().await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Escalation tick: balance lookup failed — deferring");
                for pos in &positions {
                    if let Err(e) = self.store().release(pos.id).await {
                        tracing::error!(position_id = %pos.id, error = %e, "Failed to release claim");
                    }
                }
                return Ok(());
            }
        };

        tracing::debug!(count = positions.len(), "Escalation tick: processing positions");

        for pos in positions {
            let id = pos.id;
            let pair = pos.pair.clone();

            match self.cached_price(&pair).await {
                Ok(price) => {
                    if let Err(e) = self.process_position(pos, price, &balances).await {
                        tracing::error!(pair = %pair, error = %e, "Position processing failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(pair = %pair, error = %e, "Missing price data — skipping position");
                }
            }

            if let Err(e) = self.store().release(id).await {
                tracing::error!(position_id = %id, error = %e, "Failed to release claim");
            }
        }

        Ok(())
    }

    pub(crate) async fn process_position(
        &self,
        mut pos: Position,
        price: Decimal,
        balances: &HashMap<String, Decimal>,
    ) -> anyhow::Result<()> {
        // Recency guard: let the buy settle before evaluating.
        let age = Utc::now() - pos.created_at;
        if age < chrono::Duration::seconds(self.config().grace_window_secs) {
            tracing::debug!(pair = %pos.pair, "Skipping recent position");
            return Ok(());
        }

        // Ratchet the high-water mark. Price recovery invalidates an open
        // protective order, so cancel it before persisting the new high.
        if price > pos.highest_price {
            if let Some(order_id) = pos.pending_order_id.clone() {
                match self.cancel_and_confirm(&order_id).await? {
                    CancelOutcome::AlreadyFilled(status) => {
                        let fill = status.fill_price.unwrap_or(price);
                        return self.finalize_completed(&mut pos, fill, status.fee).await;
                    }
                    CancelOutcome::Cancelled => {
                        tracing::info!(
                            pair = %pos.pair,
                            order_id = %order_id,
                            "Protective order cancelled on price recovery"
                        );
                        pos.status = PositionStatus::Active;
                        pos.pending_order_id = None;
                        tokio::time::sleep(self.config().cancel_release_delay).await;
                    }
                }
            }

            tracing::info!(
                pair = %pos.pair,
                old_high = %pos.highest_price,
                new_high = %price,
                "New high-water mark"
            );
            pos.highest_price = trailing::ratchet(pos.highest_price, price);
            pos.updated_at = Utc::now();
            self.store().update(&pos).await?;
        }

        // Fill check before any new-order logic: never place an order
        // against an already-filled position.
        if pos.status == PositionStatus::LimitPending {
            let order_id = pos.pending_order_id.clone().ok_or_else(|| {
                anyhow::anyhow!("position {} is limit_pending without an order id", pos.id)
            })?;

            let exchange = self.exchange();
            let status = self.retry().run(|| exchange.order_status(&order_id)).await?;
            if status.is_filled() {
                let fill = status.fill_price.unwrap_or(price);
                return self.finalize_completed(&mut pos, fill, status.fee).await;
            }
        }

        let triggers = trailing::compute(
            pos.highest_price,
            pos.stop_percent,
            self.config().emergency_ratio,
        );

        // Starvation guard: nothing sellable and nothing on the book means
        // the funds drifted away externally; stop servicing the position.
        let sellable = self.sellable_quantity(&pos, balances);
        if pos.pending_order_id.is_none() && sellable < self.config().min_lot {
            let live = balances
                .get(pos.base_asset())
                .copied()
                .unwrap_or(Decimal::ZERO);
            tracing::warn!(
                pair = %pos.pair,
                recorded = %pos.quantity,
                available = %live,
                "Sellable quantity below minimum lot — cancelling position"
            );
            pos.status = PositionStatus::Cancelled;
            pos.error = Some(format!(
                "sellable quantity {live} below minimum lot {}",
                self.config().min_lot
            ));
            pos.updated_at = Utc::now();
            self.store().update(&pos).await?;
            return Ok(());
        }

        // Escalation: place the protective limit sell at the stop price.
        if pos.status == PositionStatus::Active && price <= triggers.pre_limit {
            tracing::info!(
                pair = %pos.pair,
                price = %price,
                stop_price = %triggers.stop_price,
                "Pre-limit trigger breached — placing protective limit sell"
            );

            let exchange = self.exchange();
            let pair = pos.pair.clone();
            let stop_price = triggers.stop_price;
            match self
                .retry()
                .run(|| exchange.place_limit_sell(&pair, sellable, stop_price))
                .await
            {
                Ok(order_id) => {
                    pos.status = PositionStatus::LimitPending;
                    pos.pending_order_id = Some(order_id);
                    pos.updated_at = Utc::now();
                    self.store().update(&pos).await?;
                }
                Err(e) => {
                    tracing::error!(
                        pair = %pos.pair,
                        error = %e,
                        "Limit placement failed — escalating to market sell"
                    );
                    return self.emergency_market_sell(&mut pos, sellable, price).await;
                }
            }
            return Ok(());
        }

        // Emergency: the limit order has not filled despite a deep
        // retracement; abandon it for an immediate market sell.
        if pos.status == PositionStatus::LimitPending && price <= triggers.emergency {
            let order_id = pos.pending_order_id.clone().ok_or_else(|| {
                anyhow::anyhow!("position {} is limit_pending without an order id", pos.id)
            })?;

            tracing::warn!(
                pair = %pos.pair,
                price = %price,
                emergency = %triggers.emergency,
                "Emergency trigger breached — abandoning limit order"
            );

            match self.cancel_and_confirm(&order_id).await? {
                CancelOutcome::AlreadyFilled(status) => {
                    let fill = status.fill_price.unwrap_or(price);
                    return self.finalize_completed(&mut pos, fill, status.fee).await;
                }
                CancelOutcome::Cancelled => {
                    // Persist the reverted state before selling so a crash
                    // here never leaves a pointer to a dead order.
                    pos.status = PositionStatus::Active;
                    pos.pending_order_id = None;
                    pos.updated_at = Utc::now();
                    self.store().update(&pos).await?;

                    tokio::time::sleep(self.config().cancel_release_delay).await;
                    let quantity = pos.quantity;
                    return self.emergency_market_sell(&mut pos, quantity, price).await;
                }
            }
        }

        tracing::debug!(
            pair = %pos.pair,
            price = %price,
            pre_limit = %triggers.pre_limit,
            "Position within trailing bounds"
        );
        Ok(())
    }

    /// Place a market sell and confirm execution. If the order is placed but
    /// cannot be confirmed closed, its id is recorded as the pending order so
    /// the fill check or the reconciler finalizes it next tick — the order id
    /// is never dropped.
    pub(crate) async fn emergency_market_sell(
        &self,
        pos: &mut Position,
        quantity: Decimal,
        market_price: Decimal,
    ) -> anyhow::Result<()> {
        let exchange = self.exchange();
        let pair = pos.pair.clone();

        let order_id = match self
            .retry()
            .run(|| exchange.place_market_sell(&pair, quantity))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // Last durable state is untouched; next tick retries.
                tracing::error!(pair = %pos.pair, error = %e, "Market sell failed — deferring to next tick");
                return Ok(());
            }
        };

        match self.retry().run(|| exchange.order_status(&order_id)).await {
            Ok(status) if status.is_filled() => {
                let fill = status.fill_price.unwrap_or(market_price);
                self.finalize_completed(pos, fill, status.fee).await
            }
            Ok(_) => {
                tracing::warn!(
                    pair = %pos.pair,
                    order_id = %order_id,
                    "Market sell not yet confirmed — tracking order"
                );
                self.track_unconfirmed_order(pos, order_id).await
            }
            Err(e) => {
                // The order exists on the exchange even though we cannot see
                // it; losing the id would orphan it.
                tracing::error!(
                    pair = %pos.pair,
                    order_id = %order_id,
                    error = %e,
                    "Market sell status lookup failed — tracking order"
                );
                self.track_unconfirmed_order(pos, order_id).await
            }
        }
    }

    async fn track_unconfirmed_order(
        &self,
        pos: &mut Position,
        order_id: String,
    ) -> anyhow::Result<()> {
        pos.status = PositionStatus::LimitPending;
        pos.pending_order_id = Some(order_id);
        pos.updated_at = Utc::now();
        self.store().update(pos).await?;
        Ok(())
    }

    /// Manual sell: drive the most recent live position for the pair through
    /// the emergency path (cancel protective order, market sell, finalize).
    pub async fn force_exit(&self, pair: &str) -> anyhow::Result<Option<Position>> {
        let pair = pair.to_uppercase();
        let positions = self.store().list_by_pair(&pair).await?;
        let Some(mut pos) = positions.into_iter().find(|p| p.is_live()) else {
            tracing::warn!(pair = %pair, "No live position to sell");
            return Ok(None);
        };

        tracing::info!(pair = %pair, position_id = %pos.id, "Manual sell requested");

        if let Some(order_id) = pos.pending_order_id.clone() {
            match self.cancel_and_confirm(&order_id).await? {
                CancelOutcome::AlreadyFilled(status) => {
                    let fill = status.fill_price.unwrap_or(pos.buy_price);
                    self.finalize_completed(&mut pos, fill, status.fee).await?;
                    return Ok(Some(pos));
                }
                CancelOutcome::Cancelled => {
                    pos.status = PositionStatus::Active;
                    pos.pending_order_id = None;
                    pos.updated_at = Utc::now();
                    self.store().update(&pos).await?;
                    tokio::time::sleep(self.config().cancel_release_delay).await;
                }
            }
        }

        let fallback = self.cached_price(&pair).await.unwrap_or(pos.buy_price);
        let quantity = pos.quantity;
        self.emergency_market_sell(&mut pos, quantity, fallback).await?;
        Ok(Some(pos))
    }
}
