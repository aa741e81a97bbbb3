use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a position. `pending_order_id` is `Some` iff the
/// position is `LimitPending`; the three terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "position_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Active,
    LimitPending,
    Completed,
    Failed,
    Cancelled,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionStatus::Completed | PositionStatus::Failed | PositionStatus::Cancelled
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Active => "active",
            PositionStatus::LimitPending => "limit_pending",
            PositionStatus::Completed => "completed",
            PositionStatus::Failed => "failed",
            PositionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Database row for the positions table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub id: Uuid,
    pub pair: String,
    pub quantity: Decimal,
    pub buy_price: Decimal,
    pub highest_price: Decimal,
    pub stop_percent: Decimal,
    pub status: PositionStatus,
    /// Txid of the open protective sell order, if one is on the book.
    pub pending_order_id: Option<String>,
    /// Txid of the exchange buy order that opened this position.
    /// Dedup key for the reconciliation import (UNIQUE in the schema).
    pub source_order_id: Option<String>,
    pub sell_price: Option<Decimal>,
    pub fee_eur: Option<Decimal>,
    pub profit_percent: Option<Decimal>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const QUOTE_SUFFIXES: &[&str] = &["USDT", "EUR", "USD", "GBP"];

impl Position {
    pub fn new(pair: &str, quantity: Decimal, buy_price: Decimal, stop_percent: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pair: pair.to_uppercase(),
            quantity,
            buy_price,
            highest_price: buy_price,
            stop_percent,
            status: PositionStatus::Active,
            pending_order_id: None,
            source_order_id: None,
            sell_price: None,
            fee_eur: None,
            profit_percent: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Base asset of the pair, e.g. `ADAEUR` -> `ADA`.
    pub fn base_asset(&self) -> &str {
        for suffix in QUOTE_SUFFIXES {
            if let Some(base) = self.pair.strip_suffix(suffix) {
                if !base.is_empty() {
                    return base;
                }
            }
        }
        &self.pair
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}
