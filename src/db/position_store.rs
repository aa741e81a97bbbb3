use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Position;

/// Durable position ledger with an explicit claim/release protocol.
///
/// `claim_active` hands out live rows under an exclusive, non-blocking lock:
/// a row claimed by one worker pass is invisible to overlapping passes until
/// released, so order-mutating operations for a pair are never raced. Claims
/// left behind by a crashed worker expire after a TTL.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Claim every unclaimed live (`active`/`limit_pending`) position.
    async fn claim_active(&self) -> anyhow::Result<Vec<Position>>;

    /// Release a previously claimed position without mutating it.
    async fn release(&self, id: Uuid) -> anyhow::Result<()>;

    async fn insert(&self, position: &Position) -> anyhow::Result<()>;

    /// Persist every mutable field of the position. `updated_at` advances.
    async fn update(&self, position: &Position) -> anyhow::Result<()>;

    async fn list_by_pair(&self, pair: &str) -> anyhow::Result<Vec<Position>>;

    /// Whether any position was opened by the given exchange buy order.
    async fn has_source_order(&self, order_id: &str) -> anyhow::Result<bool>;

    /// Creation timestamp of the newest position, if any.
    async fn last_created_at(&self) -> anyhow::Result<Option<DateTime<Utc>>>;
}

/// Postgres-backed store. Claiming uses `FOR UPDATE SKIP LOCKED` so that a
/// slow tick still holding rows never blocks the next timer fire.
#[derive(Debug, Clone)]
pub struct PgPositionStore {
    pool: PgPool,
    claim_ttl_secs: i64,
}

impl PgPositionStore {
    pub fn new(pool: PgPool, claim_ttl_secs: i64) -> Self {
        Self {
            pool,
            claim_ttl_secs,
        }
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn claim_active(&self) -> anyhow::Result<Vec<Position>> {
        let positions = sqlx::query_as::<_, Position>(
            r#"
            UPDATE positions
            SET claimed_at = NOW()
            WHERE id IN (
                SELECT id FROM positions
                WHERE status IN ('active', 'limit_pending')
                  AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $1))
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(self.claim_ttl_secs as f64)
        .fetch_all(&self.pool)
        .await?;

        Ok(positions)
    }

    async fn release(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE positions SET claimed_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert(&self, position: &Position) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, pair, quantity, buy_price, highest_price, stop_percent,
                status, pending_order_id, source_order_id, sell_price,
                fee_eur, profit_percent, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(position.id)
        .bind(&position.pair)
        .bind(position.quantity)
        .bind(position.buy_price)
        .bind(position.highest_price)
        .bind(position.stop_percent)
        .bind(position.status)
        .bind(&position.pending_order_id)
        .bind(&position.source_order_id)
        .bind(position.sell_price)
        .bind(position.fee_eur)
        .bind(position.profit_percent)
        .bind(&position.error)
        .bind(position.created_at)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, position: &Position) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE positions
            SET quantity = $2,
                highest_price = $3,
                status = $4,
                pending_order_id = $5,
                sell_price = $6,
                fee_eur = $7,
                profit_percent = $8,
                error = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(position.id)
        .bind(position.quantity)
        .bind(position.highest_price)
        .bind(position.status)
        .bind(&position.pending_order_id)
        .bind(position.sell_price)
        .bind(position.fee_eur)
        .bind(position.profit_percent)
        .bind(&position.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_by_pair(&self, pair: &str) -> anyhow::Result<Vec<Position>> {
        let positions = sqlx::query_as::<_, Position>(
            "SELECT * FROM positions WHERE pair = $1 ORDER BY created_at DESC",
        )
        .bind(pair)
        .fetch_all(&self.pool)
        .await?;

        Ok(positions)
    }

    async fn has_source_order(&self, order_id: &str) -> anyhow::Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM positions WHERE source_order_id = $1)",
        )
        .bind(order_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn last_created_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let row: (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT MAX(created_at) FROM positions")
                .fetch_one(&self.pool)
                .await?;

        Ok(row.0)
    }
}
