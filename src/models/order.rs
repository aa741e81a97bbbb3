use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Exchange-side state of a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Open,
    Closed,
    Cancelled,
}

/// Snapshot of an order as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state: OrderState,
    pub fill_price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub fee: Option<Decimal>,
}

impl OrderStatus {
    /// A closed order that actually executed volume.
    pub fn is_filled(&self) -> bool {
        self.state == OrderState::Closed && self.filled_quantity > Decimal::ZERO
    }
}

/// One entry from the exchange's closed-order history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedOrder {
    pub order_id: String,
    pub pair: String,
    pub side: Side,
    pub fill_price: Decimal,
    pub fill_quantity: Decimal,
    pub fee: Decimal,
    pub closed_at: DateTime<Utc>,
}
