use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use trailstop::db::PositionStore;
use trailstop::engine::{Engine, EngineConfig};
use trailstop::errors::ExchangeError;
use trailstop::exchange::{ExchangeClient, PriceCache, RetryPolicy};
use trailstop::models::{ClosedOrder, OrderState, OrderStatus, Position, PositionStatus, Side};

// ---------------------------------------------------------------------------
// In-memory position store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    rows: HashMap<Uuid, Position>,
    claimed: HashSet<Uuid>,
}

/// In-memory [`PositionStore`] with the same claim/release semantics as the
/// Postgres store. Clones share state. Counts insert/update mutations so
/// idempotence can be asserted.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    mutations: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MemoryStore {
    /// Insert a row directly, bypassing the mutation counter.
    pub fn seed(&self, position: Position) {
        self.inner
            .lock()
            .unwrap()
            .rows
            .insert(position.id, position);
    }

    pub fn get(&self, id: Uuid) -> Position {
        self.inner.lock().unwrap().rows[&id].clone()
    }

    pub fn all(&self) -> Vec<Position> {
        self.inner.lock().unwrap().rows.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn no_claims_outstanding(&self) -> bool {
        self.inner.lock().unwrap().claimed.is_empty()
    }

    /// `pending_order_id` is present iff the position is `limit_pending`.
    pub fn assert_state_coherent(&self) {
        for pos in self.all() {
            assert_eq!(
                pos.status == PositionStatus::LimitPending,
                pos.pending_order_id.is_some(),
                "incoherent position {}: status {} with pending_order_id {:?}",
                pos.id,
                pos.status,
                pos.pending_order_id,
            );
        }
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn claim_active(&self) -> anyhow::Result<Vec<Position>> {
        let mut inner = self.inner.lock().unwrap();
        let mut claimed: Vec<Position> = inner
            .rows
            .values()
            .filter(|p| p.is_live() && !inner.claimed.contains(&p.id))
            .cloned()
            .collect();
        claimed.sort_by_key(|p| p.created_at);
        for pos in &claimed {
            inner.claimed.insert(pos.id);
        }
        Ok(claimed)
    }

    async fn release(&self, id: Uuid) -> anyhow::Result<()> {
        self.inner.lock().unwrap().claimed.remove(&id);
        Ok(())
    }

    async fn insert(&self, position: &Position) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(source) = &position.source_order_id {
            if inner
                .rows
                .values()
                .any(|p| p.source_order_id.as_ref() == Some(source))
            {
                anyhow::bail!("duplicate source_order_id {source}");
            }
        }
        inner.rows.insert(position.id, position.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, position: &Position) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        anyhow::ensure!(
            inner.rows.contains_key(&position.id),
            "update of unknown position {}",
            position.id
        );
        inner.rows.insert(position.id, position.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_by_pair(&self, pair: &str) -> anyhow::Result<Vec<Position>> {
        let mut rows: Vec<Position> = self
            .inner
            .lock()
            .unwrap()
            .rows
            .values()
            .filter(|p| p.pair == pair)
            .cloned()
            .collect();
        rows.sort_by_key(|p| std::cmp::Reverse(p.created_at));
        Ok(rows)
    }

    async fn has_source_order(&self, order_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rows
            .values()
            .any(|p| p.source_order_id.as_deref() == Some(order_id)))
    }

    async fn last_created_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rows
            .values()
            .map(|p| p.created_at)
            .max())
    }
}

// ---------------------------------------------------------------------------
// Mock exchange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockOrder {
    pub pair: String,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub state: OrderState,
    pub fill_price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub fee: Option<Decimal>,
}

struct ExchangeInner {
    prices: HashMap<String, Decimal>,
    balances: HashMap<String, Decimal>,
    orders: HashMap<String, MockOrder>,
    closed_history: Vec<ClosedOrder>,
    next_id: u64,
    fail_limit_orders: bool,
    market_sells_fill: bool,
}

impl Default for ExchangeInner {
    fn default() -> Self {
        Self {
            prices: HashMap::new(),
            balances: HashMap::new(),
            orders: HashMap::new(),
            closed_history: Vec::new(),
            next_id: 1,
            fail_limit_orders: false,
            market_sells_fill: true,
        }
    }
}

/// Scriptable [`ExchangeClient`] double. Clones share state.
#[derive(Clone, Default)]
pub struct MockExchange {
    inner: Arc<Mutex<ExchangeInner>>,
}

#[allow(dead_code)]
impl MockExchange {
    pub fn set_price(&self, pair: &str, price: Decimal) {
        self.inner
            .lock()
            .unwrap()
            .prices
            .insert(pair.to_string(), price);
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        self.inner
            .lock()
            .unwrap()
            .balances
            .insert(asset.to_string(), amount);
    }

    /// Reject all limit placements with a permanent error.
    pub fn fail_limit_orders(&self) {
        self.inner.lock().unwrap().fail_limit_orders = true;
    }

    /// Make market sells rest open instead of filling immediately.
    pub fn delay_market_fills(&self) {
        self.inner.lock().unwrap().market_sells_fill = false;
    }

    /// Simulate the exchange filling a resting order.
    pub fn fill_order(&self, order_id: &str, price: Decimal, fee: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        let order = inner.orders.get_mut(order_id).expect("unknown mock order");
        order.state = OrderState::Closed;
        order.fill_price = Some(price);
        order.filled_quantity = order.quantity;
        order.fee = Some(fee);
    }

    /// Register a resting order directly (for pre-seeded positions).
    pub fn seed_order(&self, order_id: &str, order: MockOrder) {
        self.inner
            .lock()
            .unwrap()
            .orders
            .insert(order_id.to_string(), order);
    }

    pub fn push_closed_order(&self, order: ClosedOrder) {
        self.inner.lock().unwrap().closed_history.push(order);
    }

    pub fn order(&self, order_id: &str) -> MockOrder {
        self.inner.lock().unwrap().orders[order_id].clone()
    }

    pub fn order_count(&self) -> usize {
        self.inner.lock().unwrap().orders.len()
    }
}

pub fn open_limit(pair: &str, quantity: Decimal, price: Decimal) -> MockOrder {
    MockOrder {
        pair: pair.to_string(),
        quantity,
        limit_price: Some(price),
        state: OrderState::Open,
        fill_price: None,
        filled_quantity: Decimal::ZERO,
        fee: None,
    }
}

#[allow(dead_code)]
pub fn filled_limit(pair: &str, quantity: Decimal, price: Decimal, fee: Decimal) -> MockOrder {
    MockOrder {
        pair: pair.to_string(),
        quantity,
        limit_price: Some(price),
        state: OrderState::Closed,
        fill_price: Some(price),
        filled_quantity: quantity,
        fee: Some(fee),
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_price(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        self.inner
            .lock()
            .unwrap()
            .prices
            .get(pair)
            .copied()
            .ok_or_else(|| ExchangeError::Permanent(format!("no ticker data for {pair}")))
    }

    async fn get_balances(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        Ok(self.inner.lock().unwrap().balances.clone())
    }

    async fn place_market_sell(
        &self,
        pair: &str,
        quantity: Decimal,
    ) -> Result<String, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        let id = format!("TX-M{}", inner.next_id);
        inner.next_id += 1;

        let (state, fill_price, filled_quantity, fee) = if inner.market_sells_fill {
            let price = inner.prices.get(pair).copied().unwrap_or(Decimal::ZERO);
            (OrderState::Closed, Some(price), quantity, Some(dec!(0.10)))
        } else {
            (OrderState::Open, None, Decimal::ZERO, None)
        };

        inner.orders.insert(
            id.clone(),
            MockOrder {
                pair: pair.to_string(),
                quantity,
                limit_price: None,
                state,
                fill_price,
                filled_quantity,
                fee,
            },
        );
        Ok(id)
    }

    async fn place_limit_sell(
        &self,
        pair: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_limit_orders {
            return Err(ExchangeError::Permanent(
                "EOrder:Insufficient funds".into(),
            ));
        }
        let id = format!("TX-L{}", inner.next_id);
        inner.next_id += 1;
        inner
            .orders
            .insert(id.clone(), open_limit(pair, quantity, price));
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::Permanent(format!("unknown order {order_id}")))?;
        match order.state {
            OrderState::Open => {
                order.state = OrderState::Cancelled;
                Ok(())
            }
            // The order already left the book; Kraken rejects the cancel.
            _ => Err(ExchangeError::Permanent(
                "EOrder:Unknown order".into(),
            )),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, ExchangeError> {
        let inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get(order_id)
            .ok_or_else(|| ExchangeError::Permanent(format!("unknown order {order_id}")))?;
        Ok(OrderStatus {
            state: order.state,
            fill_price: order.fill_price,
            filled_quantity: order.filled_quantity,
            fee: order.fee,
        })
    }

    async fn closed_orders_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClosedOrder>, ExchangeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .closed_history
            .iter()
            .filter(|o| o.closed_at >= since)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn test_config() -> EngineConfig {
    EngineConfig {
        default_stop_percent: dec!(4),
        emergency_ratio: dec!(0.95),
        grace_window_secs: 120,
        min_lot: dec!(0.0001),
        use_live_balance: true,
        balance_slack: dec!(0.9),
        cancel_release_delay: Duration::ZERO,
        sync_lookback_days: 7,
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        factor: 2,
    }
}

pub fn engine(store: MemoryStore, exchange: MockExchange) -> Engine<MemoryStore, MockExchange> {
    engine_with_config(store, exchange, test_config())
}

pub fn engine_with_config(
    store: MemoryStore,
    exchange: MockExchange,
    config: EngineConfig,
) -> Engine<MemoryStore, MockExchange> {
    // Zero TTL: every tick sees the latest scripted price.
    Engine::new(
        store,
        exchange,
        fast_retry(),
        PriceCache::new(Duration::ZERO, 100),
        config,
    )
}

/// A position old enough to clear the recency guard.
pub fn settled_position(
    pair: &str,
    quantity: Decimal,
    buy_price: Decimal,
    stop_percent: Decimal,
) -> Position {
    let mut pos = Position::new(pair, quantity, buy_price, stop_percent);
    pos.created_at = Utc::now() - ChronoDuration::hours(1);
    pos.updated_at = pos.created_at;
    pos
}

#[allow(dead_code)]
pub fn buy_fill(order_id: &str, pair: &str, quantity: Decimal, price: Decimal) -> ClosedOrder {
    ClosedOrder {
        order_id: order_id.to_string(),
        pair: pair.to_string(),
        side: Side::Buy,
        fill_price: price,
        fill_quantity: quantity,
        fee: dec!(0.15),
        closed_at: Utc::now() - ChronoDuration::minutes(30),
    }
}
