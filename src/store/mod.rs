// =============================================================================
// Store — SQLite persistence for the ledger, instrument master and config
// =============================================================================
//
// One pool, WAL mode, schema created on connect. The store is the single
// writer for order rows; concurrent writes to the same internal id are
// serialised by the primary-key upsert in ledger.rs.
// =============================================================================

pub mod ledger;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use crate::config::EngineConfig;
use crate::data::instruments::Instrument;
use crate::error::Result;

/// Fixed key for the persisted engine configuration.
pub const KEY_CURRENT_STATE: &str = "current_state";
/// Fixed key for the persisted strategy configuration.
pub const KEY_STRATEGY_CONFIG: &str = "strategy_config";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_url: &str) -> Result<Self> {
        // Ensure the parent directory exists for file-backed databases.
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            if !path_part.contains(":memory:") {
                if let Some(parent) = Path::new(path_part).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // In-memory databases are per-connection; keep the pool at one.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(url = db_url, "store connected");
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instrument_master (
                token            INTEGER PRIMARY KEY,
                trading_symbol   TEXT NOT NULL,
                symbol           TEXT NOT NULL,
                lot_size         INTEGER NOT NULL DEFAULT 1,
                tick_size        REAL NOT NULL DEFAULT 0.05,
                freeze_qty       INTEGER NOT NULL DEFAULT 1800,
                segment          TEXT NOT NULL DEFAULT 'nse_cm',
                price_precision  INTEGER NOT NULL DEFAULT 2
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_ledger (
                internal_id      TEXT PRIMARY KEY,
                exchange_id      TEXT,
                token            INTEGER NOT NULL,
                side             TEXT NOT NULL,
                order_type       TEXT NOT NULL,
                product          TEXT NOT NULL DEFAULT 'MIS',
                quantity         INTEGER NOT NULL,
                price            REAL NOT NULL DEFAULT 0,
                filled_qty       INTEGER NOT NULL DEFAULT 0,
                avg_fill_price   REAL NOT NULL DEFAULT 0,
                status           TEXT NOT NULL,
                rejection_reason TEXT,
                strategy_tag     TEXT NOT NULL DEFAULT '',
                parent_id        TEXT,
                raw_request      TEXT,
                raw_response     TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_config (
                key        TEXT PRIMARY KEY,
                payload    TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── System config ───────────────────────────────────────────────────

    /// Upsert a configuration payload under one of the fixed keys.
    pub async fn save_config(&self, key: &str, config: &EngineConfig) -> Result<()> {
        let payload = serde_json::to_string(config).map_err(|e| {
            crate::error::EngineError::Configuration(format!("config serialisation: {e}"))
        })?;
        sqlx::query(
            r#"
            INSERT INTO system_config (key, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET payload = ?2, updated_at = ?3
            "#,
        )
        .bind(key)
        .bind(payload)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_config(&self, key: &str) -> Result<Option<EngineConfig>> {
        let row = sqlx::query("SELECT payload FROM system_config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            let payload: String = r.get("payload");
            serde_json::from_str(&payload).ok()
        }))
    }

    // ── Instrument master ───────────────────────────────────────────────

    pub async fn save_instruments(&self, instruments: &[Instrument]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for inst in instruments {
            sqlx::query(
                r#"
                INSERT INTO instrument_master
                    (token, trading_symbol, symbol, lot_size, tick_size,
                     freeze_qty, segment, price_precision)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(token) DO UPDATE SET
                    trading_symbol = ?2, symbol = ?3, lot_size = ?4,
                    tick_size = ?5, freeze_qty = ?6, segment = ?7,
                    price_precision = ?8
                "#,
            )
            .bind(inst.token as i64)
            .bind(&inst.trading_symbol)
            .bind(&inst.symbol)
            .bind(inst.lot_size as i64)
            .bind(inst.tick_size)
            .bind(inst.freeze_qty as i64)
            .bind(&inst.segment)
            .bind(inst.price_precision as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(count = instruments.len(), "instrument master persisted");
        Ok(())
    }

    pub async fn load_instruments(&self) -> Result<Vec<Instrument>> {
        let rows = sqlx::query("SELECT * FROM instrument_master")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Instrument {
                token: r.get::<i64, _>("token") as u32,
                trading_symbol: r.get("trading_symbol"),
                symbol: r.get("symbol"),
                lot_size: r.get::<i64, _>("lot_size").max(1) as u64,
                tick_size: r.get("tick_size"),
                freeze_qty: r.get::<i64, _>("freeze_qty") as u64,
                segment: r.get("segment"),
                price_precision: r.get::<i64, _>("price_precision") as u32,
            })
            .collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

#[cfg(test)]
pub(crate) async fn memory_store() -> Store {
    Store::connect("sqlite://:memory:")
        .await
        .expect("in-memory store")
}
