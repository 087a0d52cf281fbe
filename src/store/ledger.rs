// =============================================================================
// Order ledger — the canonical, append-then-finalise audit trail
// =============================================================================
//
// Every leg is persisted as PENDING_BROKER before the broker call and
// finalised from the response. The transition guard forbids regressions:
// once a row reaches a terminal status, later writes (duplicate order
// updates, late socket events) are no-ops on the status while still being
// allowed to refine fill price and quantity on an already-COMPLETE row.
// =============================================================================

use serde_json::Value;
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::store::Store;
use crate::types::{OrderStatus, OrderType, Side};

/// One persisted order leg.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub internal_id: Uuid,
    pub exchange_id: Option<String>,
    pub token: u32,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: u64,
    pub price: f64,
    pub filled_qty: u64,
    pub avg_fill_price: f64,
    pub status: OrderStatus,
    pub rejection_reason: Option<String>,
    pub strategy_tag: String,
    /// Parent internal id for iceberg legs.
    pub parent_id: Option<Uuid>,
}

impl Store {
    /// Persist a fresh PENDING_BROKER row before the broker call.
    #[allow(clippy::too_many_arguments)]
    pub async fn ledger_insert_pending(
        &self,
        internal_id: Uuid,
        token: u32,
        side: Side,
        order_type: OrderType,
        quantity: u64,
        price: f64,
        strategy_tag: &str,
        parent_id: Option<Uuid>,
        raw_request: &Value,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO order_ledger
                (internal_id, token, side, order_type, quantity, price,
                 status, strategy_tag, parent_id, raw_request,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            "#,
        )
        .bind(internal_id.to_string())
        .bind(token as i64)
        .bind(side.to_string())
        .bind(order_type.wire())
        .bind(quantity as i64)
        .bind(price)
        .bind(OrderStatus::PendingBroker.as_str())
        .bind(strategy_tag)
        .bind(parent_id.map(|p| p.to_string()))
        .bind(raw_request.to_string())
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Finalise a row from the broker response. Guarded: a row already in a
    /// terminal status is left untouched.
    pub async fn ledger_finalize(
        &self,
        internal_id: Uuid,
        exchange_id: Option<&str>,
        status: OrderStatus,
        rejection_reason: Option<&str>,
        raw_response: &Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE order_ledger SET
                exchange_id = COALESCE(?2, exchange_id),
                status = ?3,
                rejection_reason = ?4,
                raw_response = ?5,
                updated_at = ?6
            WHERE internal_id = ?1
              AND status NOT IN ('COMPLETE', 'REJECTED', 'CANCELLED', 'FAILED')
            "#,
        )
        .bind(internal_id.to_string())
        .bind(exchange_id)
        .bind(status.as_str())
        .bind(rejection_reason)
        .bind(raw_response.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            warn!(
                internal_id = %internal_id,
                attempted = status.as_str(),
                "ledger write skipped: row already terminal"
            );
        }
        Ok(applied)
    }

    /// Apply a broker-pushed order update by exchange id. Fill fields are
    /// refined idempotently; the status guard still forbids leaving a
    /// terminal state (COMPLETE -> COMPLETE with better fill data is fine).
    pub async fn ledger_apply_update(
        &self,
        exchange_id: &str,
        status: OrderStatus,
        filled_qty: u64,
        avg_fill_price: f64,
        rejection_reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE order_ledger SET
                status = CASE
                    WHEN status IN ('COMPLETE', 'REJECTED', 'CANCELLED', 'FAILED')
                    THEN status ELSE ?2 END,
                filled_qty = ?3,
                avg_fill_price = ?4,
                rejection_reason = COALESCE(?5, rejection_reason),
                updated_at = ?6
            WHERE exchange_id = ?1
            "#,
        )
        .bind(exchange_id)
        .bind(status.as_str())
        .bind(filled_qty as i64)
        .bind(avg_fill_price)
        .bind(rejection_reason)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn ledger_fetch(&self, internal_id: Uuid) -> Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM order_ledger WHERE internal_id = ?1")
            .bind(internal_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(record_from_row))
    }

    /// All legs of an iceberg chain, oldest first.
    pub async fn ledger_fetch_children(&self, parent_id: Uuid) -> Result<Vec<OrderRecord>> {
        let rows =
            sqlx::query("SELECT * FROM order_ledger WHERE parent_id = ?1 ORDER BY created_at")
                .bind(parent_id.to_string())
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(record_from_row).collect())
    }
}

fn record_from_row(r: sqlx::sqlite::SqliteRow) -> OrderRecord {
    let side: String = r.get("side");
    let order_type: String = r.get("order_type");
    let status: String = r.get("status");
    OrderRecord {
        internal_id: r
            .get::<String, _>("internal_id")
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        exchange_id: r.get("exchange_id"),
        token: r.get::<i64, _>("token") as u32,
        side: if side == "SELL" { Side::Sell } else { Side::Buy },
        order_type: if order_type == "L" {
            OrderType::Limit
        } else {
            OrderType::Market
        },
        quantity: r.get::<i64, _>("quantity") as u64,
        price: r.get("price"),
        filled_qty: r.get::<i64, _>("filled_qty") as u64,
        avg_fill_price: r.get("avg_fill_price"),
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Failed),
        rejection_reason: r.get("rejection_reason"),
        strategy_tag: r.get("strategy_tag"),
        parent_id: r
            .get::<Option<String>, _>("parent_id")
            .and_then(|p| p.parse().ok()),
    }
}
