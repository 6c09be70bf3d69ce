// PostgreSQL Store
//
// Schema is created at connect. Addresses are stored as lowercase 0x hex,
// amounts and fixed-point prices as NUMERIC.

use super::{CursorStream, Store};
use crate::pricing::{format_fixed, PRICE_DECIMALS};
use crate::types::{AllowList, Job, PairRecord, TradeRecord};
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use eyre::WrapErr;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::info;

pub struct PgStore {
    pool: PgPool,
}

fn addr(address: &Address) -> String {
    format!("{address:#x}")
}

fn parse_addr(row: &PgRow, column: &str) -> eyre::Result<Address> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .wrap_err_with(|| format!("column {column} holds invalid address '{raw}'"))
}

fn price_str(value: Option<U256>) -> eyre::Result<Option<String>> {
    value.map(|v| format_fixed(v, PRICE_DECIMALS)).transpose()
}

fn pair_from_row(row: &PgRow) -> eyre::Result<PairRecord> {
    Ok(PairRecord {
        address: parse_addr(row, "address")?,
        token0: parse_addr(row, "token0")?,
        token1: parse_addr(row, "token1")?,
        created_block: row.try_get::<i64, _>("created_block")? as u64,
        subscribed: row.try_get("subscribed")?,
    })
}

fn job_from_row(row: &PgRow) -> eyre::Result<Job> {
    let kind: String = row.try_get("kind")?;
    Ok(Job {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        pair: parse_addr(row, "pair")?,
        from_block: row.try_get::<i64, _>("from_block")? as u64,
        to_block: row
            .try_get::<Option<i64>, _>("to_block")?
            .map(|b| b as u64),
        retries: row.try_get::<i32, _>("retries")? as u32,
    })
}

impl PgStore {
    pub async fn connect(database_url: &str) -> eyre::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(300))
            .connect(database_url)
            .await
            .wrap_err("failed to connect to PostgreSQL")?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("Connected to PostgreSQL");
        Ok(store)
    }

    async fn init_schema(&self) -> eyre::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pairs (
                address         TEXT PRIMARY KEY,
                token0          TEXT NOT NULL,
                token1          TEXT NOT NULL,
                created_block   BIGINT NOT NULL DEFAULT 0,
                subscribed      BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                tx_hash         TEXT NOT NULL,
                log_index       BIGINT NOT NULL,
                block_number    BIGINT NOT NULL,
                block_timestamp BIGINT NOT NULL,
                pair            TEXT NOT NULL,
                token0          TEXT NOT NULL,
                token1          TEXT NOT NULL,
                amount0_in      NUMERIC NOT NULL,
                amount1_in      NUMERIC NOT NULL,
                amount0_out     NUMERIC NOT NULL,
                amount1_out     NUMERIC NOT NULL,
                decimals0       SMALLINT NOT NULL,
                decimals1       SMALLINT NOT NULL,
                recipient       TEXT NOT NULL,
                price           NUMERIC,
                token0_price    NUMERIC,
                token1_price    NUMERIC,
                volume          NUMERIC,
                CONSTRAINT trades_pkey PRIMARY KEY (tx_hash, log_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_pair_block ON trades (pair, block_number)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_block_timestamp ON trades (block_timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                stream          TEXT PRIMARY KEY,
                block_number    BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                seq             BIGSERIAL,
                kind            TEXT NOT NULL,
                pair            TEXT NOT NULL,
                from_block      BIGINT NOT NULL,
                to_block        BIGINT,
                retries         INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database schema initialized");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_pair(&self, pair: &PairRecord) -> eyre::Result<bool> {
        // xmax = 0 only for rows created by this statement
        let row = sqlx::query(
            r#"
            INSERT INTO pairs (address, token0, token1, created_block)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (address) DO UPDATE SET
                created_block = CASE
                    WHEN pairs.created_block = 0 THEN EXCLUDED.created_block
                    ELSE pairs.created_block
                END
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(addr(&pair.address))
        .bind(addr(&pair.token0))
        .bind(addr(&pair.token1))
        .bind(pair.created_block as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("inserted")?)
    }

    async fn pair(&self, address: Address) -> eyre::Result<Option<PairRecord>> {
        let row = sqlx::query(
            "SELECT address, token0, token1, created_block, subscribed FROM pairs WHERE address = $1",
        )
        .bind(addr(&address))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(pair_from_row).transpose()
    }

    async fn allowed_pairs(&self, allow: &AllowList) -> eyre::Result<Vec<PairRecord>> {
        let tokens: Vec<String> = allow.tokens().iter().map(addr).collect();
        let rows = sqlx::query(
            r#"
            SELECT address, token0, token1, created_block, subscribed FROM pairs
            WHERE token0 = ANY($1) OR token1 = ANY($1)
            ORDER BY address
            "#,
        )
        .bind(tokens)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pair_from_row).collect()
    }

    async fn mark_subscribed(&self, address: Address) -> eyre::Result<()> {
        let result = sqlx::query("UPDATE pairs SET subscribed = TRUE WHERE address = $1")
            .bind(addr(&address))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            eyre::bail!("pair {address:#x} not found");
        }
        Ok(())
    }

    async fn insert_trade(&self, trade: &TradeRecord) -> eyre::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                tx_hash, log_index, block_number, block_timestamp, pair, token0, token1,
                amount0_in, amount1_in, amount0_out, amount1_out, decimals0, decimals1,
                recipient, price, token0_price, token1_price, volume
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8::NUMERIC, $9::NUMERIC, $10::NUMERIC, $11::NUMERIC, $12, $13,
                $14, $15::NUMERIC, $16::NUMERIC, $17::NUMERIC, $18::NUMERIC
            )
            ON CONFLICT (tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(trade.tx_hash.to_string())
        .bind(trade.log_index as i64)
        .bind(trade.block_number as i64)
        .bind(trade.block_timestamp as i64)
        .bind(addr(&trade.pair))
        .bind(addr(&trade.token0))
        .bind(addr(&trade.token1))
        .bind(trade.amount0_in.to_string())
        .bind(trade.amount1_in.to_string())
        .bind(trade.amount0_out.to_string())
        .bind(trade.amount1_out.to_string())
        .bind(trade.decimals0 as i16)
        .bind(trade.decimals1 as i16)
        .bind(addr(&trade.recipient))
        .bind(price_str(trade.price)?)
        .bind(price_str(trade.token0_price)?)
        .bind(price_str(trade.token1_price)?)
        .bind(price_str(trade.volume)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn trade_count(&self) -> eyre::Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn cursor(&self, stream: CursorStream) -> eyre::Result<Option<u64>> {
        let block: Option<i64> =
            sqlx::query_scalar("SELECT block_number FROM cursors WHERE stream = $1")
                .bind(stream.name())
                .fetch_optional(&self.pool)
                .await?;
        Ok(block.map(|b| b as u64))
    }

    async fn advance_cursor(&self, stream: CursorStream, block: u64) -> eyre::Result<u64> {
        let stored: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cursors (stream, block_number) VALUES ($1, $2)
            ON CONFLICT (stream) DO UPDATE SET
                block_number = GREATEST(cursors.block_number, EXCLUDED.block_number)
            RETURNING block_number
            "#,
        )
        .bind(stream.name())
        .bind(block as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored as u64)
    }

    async fn save_job(&self, job: &Job) -> eyre::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, pair, from_block, to_block, retries)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                to_block = EXCLUDED.to_block,
                retries = EXCLUDED.retries
            "#,
        )
        .bind(&job.id)
        .bind(job.kind.as_str())
        .bind(addr(&job.pair))
        .bind(job.from_block as i64)
        .bind(job.to_block.map(|b| b as i64))
        .bind(job.retries as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> eyre::Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_jobs(&self) -> eyre::Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, kind, pair, from_block, to_block, retries FROM jobs ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }
}
