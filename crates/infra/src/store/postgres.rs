//! Postgres-backed stock store.
//!
//! The same pool also backs the outbox, alert and vehicle stores.
//!
//! One `commit` is one SQL transaction: version-checked row writes, ledger inserts,
//! the idempotency key and the outbox rows either all land or none do.
//!
//! ## Concurrency
//!
//! Existing rows are updated with `WHERE version = $expected`; zero affected rows
//! means another transaction got there first and the commit fails with
//! `StoreError::Conflict`. New rows are inserted with `ON CONFLICT DO NOTHING`
//! for the same effect. The row lock taken by the update serializes writers per key
//! until the transaction ends.
//!
//! ## Runtime
//!
//! The store traits are synchronous. The store keeps a handle to the tokio runtime it
//! was created on and blocks on it, so it must be called from outside async tasks
//! (std threads or `spawn_blocking`).
//!
//! ## Error mapping
//!
//! | SQLx error                     | StoreError  |
//! |--------------------------------|-------------|
//! | unique violation (`23505`)     | `Conflict`  |
//! | check violation (`23514`)      | `Corrupt`   |
//! | other database / pool / io     | `Backend`   |

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{instrument, Span};

use stockledger_core::{AggregateRoot, AlertId, DealerId, StaffId, TransactionId, VariantId};
use stockledger_events::EventEnvelope;
use stockledger_inventory::{
    AlertCandidate, AlertStatus, CentralStock, DealerAllocation, InventoryTransaction,
    PhysicalVehicle, StockAlert, StockScope, TransactionRequest, TransferRequest, Vin,
};
use uuid::Uuid;

use super::r#trait::{
    outbox_envelopes, AlertStore, Committed, OutboxMessage, OutboxStore, StockStore, StoreError,
    UnitOfWork, VehicleStore,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS central_stock (
        variant_id         BIGINT PRIMARY KEY,
        total_imported     BIGINT NOT NULL,
        allocated_quantity BIGINT NOT NULL CHECK (allocated_quantity >= 0),
        available_quantity BIGINT NOT NULL CHECK (available_quantity >= 0),
        reorder_level      BIGINT NOT NULL DEFAULT 0,
        version            BIGINT NOT NULL,
        updated_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CHECK (allocated_quantity <= total_imported)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dealer_allocation (
        variant_id         BIGINT NOT NULL,
        dealer_id          BIGINT NOT NULL,
        allocated_quantity BIGINT NOT NULL,
        available_quantity BIGINT NOT NULL CHECK (available_quantity >= 0),
        reorder_level      BIGINT NOT NULL DEFAULT 0,
        status             TEXT NOT NULL DEFAULT 'new',
        version            BIGINT NOT NULL,
        updated_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (variant_id, dealer_id),
        CHECK (available_quantity <= allocated_quantity)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS inventory_transactions (
        transaction_id   BIGSERIAL PRIMARY KEY,
        variant_id       BIGINT NOT NULL,
        transaction_type TEXT NOT NULL,
        quantity         BIGINT NOT NULL CHECK (quantity > 0),
        from_dealer_id   BIGINT NULL,
        to_dealer_id     BIGINT NULL,
        transaction_date TIMESTAMPTZ NOT NULL,
        staff_id         TEXT NOT NULL,
        reference_id     TEXT NULL,
        notes            TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS inventory_transactions_variant ON inventory_transactions (variant_id, transaction_id)",
    "CREATE INDEX IF NOT EXISTS inventory_transactions_reference ON inventory_transactions (reference_id)",
    r#"
    CREATE TABLE IF NOT EXISTS stock_idempotency_keys (
        idempotency_key TEXT PRIMARY KEY,
        committed_at    TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_outbox (
        outbox_id    BIGSERIAL PRIMARY KEY,
        envelope     JSONB NOT NULL,
        attempts     INTEGER NOT NULL DEFAULT 0,
        last_error   TEXT NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        published_at TIMESTAMPTZ NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS stock_outbox_pending ON stock_outbox (outbox_id) WHERE published_at IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS stock_alerts (
        alert_id      BIGSERIAL PRIMARY KEY,
        variant_id    BIGINT NOT NULL,
        dealer_id     BIGINT NULL,
        alert_type    TEXT NOT NULL,
        current_stock BIGINT NOT NULL,
        threshold     BIGINT NOT NULL,
        alert_date    TIMESTAMPTZ NOT NULL,
        status        TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS stock_alerts_one_open ON stock_alerts (variant_id, COALESCE(dealer_id, -1)) WHERE status = 'NEW'",
    r#"
    CREATE TABLE IF NOT EXISTS vehicles (
        vin        TEXT PRIMARY KEY,
        variant_id BIGINT NOT NULL,
        body       JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transfer_requests (
        request_id UUID PRIMARY KEY,
        status     TEXT NOT NULL,
        terminal   BOOLEAN NOT NULL,
        body       JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS transfer_requests_open ON transfer_requests USING GIN ((body -> 'vins')) WHERE NOT terminal",
];

#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresStockStore {
    /// Create a store bound to the runtime of the current context.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            StoreError::Backend(
                "PostgresStockStore must be created inside a tokio runtime".to_string(),
            )
        })?;
        Ok(Self { pool, runtime })
    }

    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(
        skip(self, uow),
        fields(
            centrals = uow.centrals.len(),
            dealers = uow.dealers.len(),
            entries = uow.entries.len(),
            idempotency_key = ?uow.idempotency_key,
            committed_entries = tracing::field::Empty
        ),
        err
    )]
    pub async fn commit_async(&self, uow: UnitOfWork) -> Result<Committed, StoreError> {
        let at = uow.occurred_at.unwrap_or_else(Utc::now);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(key) = &uow.idempotency_key {
            let inserted = sqlx::query(
                r#"
                INSERT INTO stock_idempotency_keys (idempotency_key, committed_at)
                VALUES ($1, $2)
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_idempotency_key", e))?
            .rows_affected();

            if inserted == 0 {
                rollback(tx).await?;
                return Err(StoreError::Duplicate(key.clone()));
            }
        }

        let mut centrals = Vec::with_capacity(uow.centrals.len());
        for row in &uow.centrals {
            if let Err(e) = write_central(&mut tx, row).await {
                rollback(tx).await?;
                return Err(e);
            }
            centrals.push(row.clone().with_version(row.version() + 1));
        }

        let mut dealers = Vec::with_capacity(uow.dealers.len());
        for row in &uow.dealers {
            if let Err(e) = write_dealer(&mut tx, row).await {
                rollback(tx).await?;
                return Err(e);
            }
            dealers.push(row.clone().with_version(row.version() + 1));
        }

        let mut ids = Vec::with_capacity(uow.entries.len());
        for entry in &uow.entries {
            match insert_entry(&mut tx, entry, at).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    rollback(tx).await?;
                    return Err(e);
                }
            }
        }
        let records = uow.records(&ids, at);

        let envelopes = match outbox_envelopes(&centrals, &dealers, &records, at) {
            Ok(e) => e,
            Err(e) => {
                rollback(tx).await?;
                return Err(e);
            }
        };
        for envelope in &envelopes {
            let json = serde_json::to_value(envelope)
                .map_err(|e| StoreError::Corrupt(format!("outbox envelope serialization failed: {e}")));
            let json = match json {
                Ok(j) => j,
                Err(e) => {
                    rollback(tx).await?;
                    return Err(e);
                }
            };
            sqlx::query("INSERT INTO stock_outbox (envelope, created_at) VALUES ($1, $2)")
                .bind(json)
                .bind(at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_outbox", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_entries", records.len());
        Ok(Committed {
            transactions: records,
            centrals,
            dealers,
        })
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

async fn write_central(tx: &mut Transaction<'_, Postgres>, row: &CentralStock) -> Result<(), StoreError> {
    let affected = if row.is_persisted() {
        sqlx::query(
            r#"
            UPDATE central_stock
            SET total_imported = $2, allocated_quantity = $3, available_quantity = $4,
                reorder_level = $5, version = version + 1, updated_at = NOW()
            WHERE variant_id = $1 AND version = $6
            "#,
        )
        .bind(row.variant_id().get())
        .bind(row.total_imported())
        .bind(row.allocated_quantity())
        .bind(row.available_quantity())
        .bind(row.reorder_level())
        .bind(row.version() as i64)
        .execute(&mut **tx)
        .await
    } else {
        sqlx::query(
            r#"
            INSERT INTO central_stock
                (variant_id, total_imported, allocated_quantity, available_quantity, reorder_level, version)
            VALUES ($1, $2, $3, $4, $5, 1)
            ON CONFLICT (variant_id) DO NOTHING
            "#,
        )
        .bind(row.variant_id().get())
        .bind(row.total_imported())
        .bind(row.allocated_quantity())
        .bind(row.available_quantity())
        .bind(row.reorder_level())
        .execute(&mut **tx)
        .await
    }
    .map_err(|e| map_sqlx_error("write_central", e))?;

    if affected.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "central stock for variant {} changed since version {}",
            row.variant_id(),
            row.version()
        )));
    }
    Ok(())
}

async fn write_dealer(tx: &mut Transaction<'_, Postgres>, row: &DealerAllocation) -> Result<(), StoreError> {
    let affected = if row.is_persisted() {
        sqlx::query(
            r#"
            UPDATE dealer_allocation
            SET allocated_quantity = $3, available_quantity = $4, reorder_level = $5,
                status = $6, version = version + 1, updated_at = NOW()
            WHERE variant_id = $1 AND dealer_id = $2 AND version = $7
            "#,
        )
        .bind(row.variant_id().get())
        .bind(row.dealer_id().get())
        .bind(row.allocated_quantity())
        .bind(row.available_quantity())
        .bind(row.reorder_level())
        .bind(row.status())
        .bind(row.version() as i64)
        .execute(&mut **tx)
        .await
    } else {
        sqlx::query(
            r#"
            INSERT INTO dealer_allocation
                (variant_id, dealer_id, allocated_quantity, available_quantity, reorder_level, status, version)
            VALUES ($1, $2, $3, $4, $5, $6, 1)
            ON CONFLICT (variant_id, dealer_id) DO NOTHING
            "#,
        )
        .bind(row.variant_id().get())
        .bind(row.dealer_id().get())
        .bind(row.allocated_quantity())
        .bind(row.available_quantity())
        .bind(row.reorder_level())
        .bind(row.status())
        .execute(&mut **tx)
        .await
    }
    .map_err(|e| map_sqlx_error("write_dealer", e))?;

    if affected.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "dealer {} stock for variant {} changed since version {}",
            row.dealer_id(),
            row.variant_id(),
            row.version()
        )));
    }
    Ok(())
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    entry: &TransactionRequest,
    at: DateTime<Utc>,
) -> Result<TransactionId, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO inventory_transactions
            (variant_id, transaction_type, quantity, from_dealer_id, to_dealer_id,
             transaction_date, staff_id, reference_id, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING transaction_id
        "#,
    )
    .bind(entry.variant_id.get())
    .bind(entry.transaction_type.as_str())
    .bind(entry.quantity)
    .bind(entry.from_dealer_id.map(|d| d.get()))
    .bind(entry.to_dealer_id.map(|d| d.get()))
    .bind(at)
    .bind(entry.staff_id.as_str())
    .bind(entry.reference_id.as_deref())
    .bind(entry.notes.as_deref())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_transaction", e))?;

    let id: i64 = row
        .try_get("transaction_id")
        .map_err(|e| StoreError::Corrupt(format!("failed to read transaction_id: {e}")))?;
    Ok(TransactionId::new(id as u64))
}

fn central_from_row(row: &PgRow) -> Result<CentralStock, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("failed to read central_stock row: {e}"));
    let version: i64 = row.try_get("version").map_err(read)?;
    CentralStock::restore(
        VariantId::new(row.try_get("variant_id").map_err(read)?),
        row.try_get("total_imported").map_err(read)?,
        row.try_get("allocated_quantity").map_err(read)?,
        row.try_get("available_quantity").map_err(read)?,
        row.try_get("reorder_level").map_err(read)?,
        version as u64,
    )
    .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn dealer_from_row(row: &PgRow) -> Result<DealerAllocation, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("failed to read dealer_allocation row: {e}"));
    let version: i64 = row.try_get("version").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;
    DealerAllocation::restore(
        DealerId::new(row.try_get("dealer_id").map_err(read)?),
        VariantId::new(row.try_get("variant_id").map_err(read)?),
        row.try_get("allocated_quantity").map_err(read)?,
        row.try_get("available_quantity").map_err(read)?,
        row.try_get("reorder_level").map_err(read)?,
        status,
        version as u64,
    )
    .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn transaction_from_row(row: &PgRow) -> Result<InventoryTransaction, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("failed to read ledger row: {e}"));
    let corrupt = |e: stockledger_core::DomainError| StoreError::Corrupt(e.to_string());

    let id: i64 = row.try_get("transaction_id").map_err(read)?;
    let kind: String = row.try_get("transaction_type").map_err(read)?;
    let from: Option<i64> = row.try_get("from_dealer_id").map_err(read)?;
    let to: Option<i64> = row.try_get("to_dealer_id").map_err(read)?;
    let staff: String = row.try_get("staff_id").map_err(read)?;

    Ok(InventoryTransaction {
        transaction_id: TransactionId::new(id as u64),
        variant_id: VariantId::new(row.try_get("variant_id").map_err(read)?),
        transaction_type: kind.parse().map_err(corrupt)?,
        quantity: row.try_get("quantity").map_err(read)?,
        from_dealer_id: from.map(DealerId::new),
        to_dealer_id: to.map(DealerId::new),
        transaction_date: row.try_get("transaction_date").map_err(read)?,
        staff_id: StaffId::new(staff).map_err(corrupt)?,
        reference_id: row.try_get("reference_id").map_err(read)?,
        notes: row.try_get("notes").map_err(read)?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<StockAlert, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("failed to read stock_alerts row: {e}"));
    let corrupt = |e: stockledger_core::DomainError| StoreError::Corrupt(e.to_string());

    let id: i64 = row.try_get("alert_id").map_err(read)?;
    let dealer: Option<i64> = row.try_get("dealer_id").map_err(read)?;
    let alert_type: String = row.try_get("alert_type").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;

    Ok(StockAlert {
        alert_id: AlertId::new(id as u64),
        variant_id: VariantId::new(row.try_get("variant_id").map_err(read)?),
        dealer_id: dealer.map(DealerId::new),
        alert_type: alert_type.parse().map_err(corrupt)?,
        current_stock: row.try_get("current_stock").map_err(read)?,
        threshold: row.try_get("threshold").map_err(read)?,
        alert_date: row.try_get("alert_date").map_err(read)?,
        status: status.parse().map_err(corrupt)?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxMessage, StoreError> {
    let read = |e: sqlx::Error| StoreError::Corrupt(format!("failed to read outbox row: {e}"));
    let id: i64 = row.try_get("outbox_id").map_err(read)?;
    let json: JsonValue = row.try_get("envelope").map_err(read)?;
    let attempts: i32 = row.try_get("attempts").map_err(read)?;
    let envelope: EventEnvelope<JsonValue> = serde_json::from_value(json)
        .map_err(|e| StoreError::Corrupt(format!("outbox envelope {id}: {e}")))?;
    Ok(OutboxMessage {
        outbox_id: id as u64,
        envelope,
        attempts: attempts as u32,
        last_error: row.try_get("last_error").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        published_at: row.try_get("published_at").map_err(read)?,
    })
}

fn body_from_row<T: serde::de::DeserializeOwned>(row: &PgRow, table: &str) -> Result<T, StoreError> {
    let json: JsonValue = row
        .try_get("body")
        .map_err(|e| StoreError::Corrupt(format!("failed to read {table} row: {e}")))?;
    serde_json::from_value(json).map_err(|e| StoreError::Corrupt(format!("{table} body: {e}")))
}

fn body_to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(format!("serialization failed: {e}")))
}

const LEDGER_COLUMNS: &str = "transaction_id, variant_id, transaction_type, quantity, from_dealer_id, \
     to_dealer_id, transaction_date, staff_id, reference_id, notes";

const ALERT_COLUMNS: &str =
    "alert_id, variant_id, dealer_id, alert_type, current_stock, threshold, alert_date, status";

impl StockStore for PostgresStockStore {
    fn load_central(&self, variant_id: VariantId) -> Result<Option<CentralStock>, StoreError> {
        self.block_on(async {
            let row = sqlx::query(
                r#"
                SELECT variant_id, total_imported, allocated_quantity, available_quantity,
                       reorder_level, version
                FROM central_stock
                WHERE variant_id = $1
                "#,
            )
            .bind(variant_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_central", e))?;
            row.as_ref().map(central_from_row).transpose()
        })
    }

    fn load_dealer(
        &self,
        dealer_id: DealerId,
        variant_id: VariantId,
    ) -> Result<Option<DealerAllocation>, StoreError> {
        self.block_on(async {
            let row = sqlx::query(
                r#"
                SELECT variant_id, dealer_id, allocated_quantity, available_quantity,
                       reorder_level, status, version
                FROM dealer_allocation
                WHERE variant_id = $1 AND dealer_id = $2
                "#,
            )
            .bind(variant_id.get())
            .bind(dealer_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_dealer", e))?;
            row.as_ref().map(dealer_from_row).transpose()
        })
    }

    fn dealer_allocations(&self, variant_id: VariantId) -> Result<Vec<DealerAllocation>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT variant_id, dealer_id, allocated_quantity, available_quantity,
                       reorder_level, status, version
                FROM dealer_allocation
                WHERE variant_id = $1
                ORDER BY dealer_id ASC
                "#,
            )
            .bind(variant_id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("dealer_allocations", e))?;
            rows.iter().map(dealer_from_row).collect()
        })
    }

    fn variant_ids(&self) -> Result<Vec<VariantId>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT variant_id FROM central_stock
                UNION
                SELECT variant_id FROM dealer_allocation
                ORDER BY variant_id ASC
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("variant_ids", e))?;
            rows.iter()
                .map(|r| {
                    r.try_get::<i64, _>("variant_id")
                        .map(VariantId::new)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))
                })
                .collect()
        })
    }

    fn commit(&self, uow: UnitOfWork) -> Result<Committed, StoreError> {
        self.block_on(self.commit_async(uow))
    }

    fn ledger(&self, variant_id: VariantId) -> Result<Vec<InventoryTransaction>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {LEDGER_COLUMNS} FROM inventory_transactions WHERE variant_id = $1 ORDER BY transaction_id ASC"
            ))
            .bind(variant_id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ledger", e))?;
            rows.iter().map(transaction_from_row).collect()
        })
    }

    fn ledger_by_reference(&self, reference_id: &str) -> Result<Vec<InventoryTransaction>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {LEDGER_COLUMNS} FROM inventory_transactions WHERE reference_id = $1 ORDER BY transaction_id ASC"
            ))
            .bind(reference_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ledger_by_reference", e))?;
            rows.iter().map(transaction_from_row).collect()
        })
    }
}

impl OutboxStore for PostgresStockStore {
    fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT outbox_id, envelope, attempts, last_error, created_at, published_at
                FROM stock_outbox
                WHERE published_at IS NULL
                ORDER BY outbox_id ASC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending_outbox", e))?;

            rows.iter().map(outbox_from_row).collect()
        })
    }

    fn mark_published(&self, outbox_id: u64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.block_on(async {
            sqlx::query(
                "UPDATE stock_outbox SET published_at = $2, attempts = attempts + 1 WHERE outbox_id = $1",
            )
            .bind(outbox_id as i64)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_published", e))?;
            Ok(())
        })
    }

    fn record_failure(&self, outbox_id: u64, error: &str) -> Result<(), StoreError> {
        self.block_on(async {
            sqlx::query(
                "UPDATE stock_outbox SET attempts = attempts + 1, last_error = $2 WHERE outbox_id = $1",
            )
            .bind(outbox_id as i64)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_outbox_failure", e))?;
            Ok(())
        })
    }

    fn history(&self, after_id: u64, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT outbox_id, envelope, attempts, last_error, created_at, published_at
                FROM stock_outbox
                WHERE outbox_id > $1
                ORDER BY outbox_id ASC
                LIMIT $2
                "#,
            )
            .bind(after_id as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("outbox_history", e))?;
            rows.iter().map(outbox_from_row).collect()
        })
    }
}

impl AlertStore for PostgresStockStore {
    fn find_open(&self, variant_id: VariantId, scope: StockScope) -> Result<Option<StockAlert>, StoreError> {
        self.block_on(async {
            let row = sqlx::query(&format!(
                r#"
                SELECT {ALERT_COLUMNS} FROM stock_alerts
                WHERE variant_id = $1 AND dealer_id IS NOT DISTINCT FROM $2 AND status = 'NEW'
                "#
            ))
            .bind(variant_id.get())
            .bind(scope.dealer_id().map(|d| d.get()))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_open_alert", e))?;
            row.as_ref().map(alert_from_row).transpose()
        })
    }

    fn open_if_absent(
        &self,
        candidate: &AlertCandidate,
        at: DateTime<Utc>,
    ) -> Result<Option<StockAlert>, StoreError> {
        self.block_on(async {
            // The partial unique index on open alerts makes the insert a no-op for duplicates.
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO stock_alerts
                    (variant_id, dealer_id, alert_type, current_stock, threshold, alert_date, status)
                VALUES ($1, $2, $3, $4, $5, $6, 'NEW')
                ON CONFLICT DO NOTHING
                RETURNING {ALERT_COLUMNS}
                "#
            ))
            .bind(candidate.variant_id.get())
            .bind(candidate.scope.dealer_id().map(|d| d.get()))
            .bind(candidate.alert_type().as_str())
            .bind(candidate.current_stock)
            .bind(candidate.threshold)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("open_alert", e))?;
            row.as_ref().map(alert_from_row).transpose()
        })
    }

    fn get(&self, alert_id: AlertId) -> Result<Option<StockAlert>, StoreError> {
        self.block_on(async {
            let row = sqlx::query(&format!("SELECT {ALERT_COLUMNS} FROM stock_alerts WHERE alert_id = $1"))
                .bind(alert_id.get() as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_alert", e))?;
            row.as_ref().map(alert_from_row).transpose()
        })
    }

    fn list(&self, status: Option<AlertStatus>) -> Result<Vec<StockAlert>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {ALERT_COLUMNS} FROM stock_alerts
                WHERE ($1::text IS NULL OR status = $1)
                ORDER BY alert_id ASC
                "#
            ))
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_alerts", e))?;
            rows.iter().map(alert_from_row).collect()
        })
    }

    fn update_status(
        &self,
        alert_id: AlertId,
        expected: AlertStatus,
        status: AlertStatus,
    ) -> Result<StockAlert, StoreError> {
        self.block_on(async {
            let row = sqlx::query(&format!(
                r#"
                UPDATE stock_alerts SET status = $2
                WHERE alert_id = $1 AND status = $3
                RETURNING {ALERT_COLUMNS}
                "#
            ))
            .bind(alert_id.get() as i64)
            .bind(status.as_str())
            .bind(expected.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_alert_status", e))?;
            if let Some(row) = row {
                return alert_from_row(&row);
            }

            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM stock_alerts WHERE alert_id = $1")
                    .bind(alert_id.get() as i64)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("update_alert_status", e))?;
            match current {
                Some(current) => Err(StoreError::Conflict(format!(
                    "alert {alert_id} is {current}, expected {}",
                    expected.as_str()
                ))),
                None => Err(StoreError::NotFound(format!("alert {alert_id}"))),
            }
        })
    }
}

impl VehicleStore for PostgresStockStore {
    fn load_vehicle(&self, vin: &Vin) -> Result<Option<PhysicalVehicle>, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT body FROM vehicles WHERE vin = $1")
                .bind(vin.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_vehicle", e))?;
            row.as_ref().map(|r| body_from_row(r, "vehicles")).transpose()
        })
    }

    fn load_request(&self, request_id: Uuid) -> Result<Option<TransferRequest>, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT body FROM transfer_requests WHERE request_id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_transfer_request", e))?;
            row.as_ref().map(|r| body_from_row(r, "transfer_requests")).transpose()
        })
    }

    fn is_reserved(&self, vin: &Vin) -> Result<bool, StoreError> {
        self.block_on(async {
            sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM transfer_requests
                    WHERE NOT terminal AND body -> 'vins' ? $1
                )
                "#,
            )
            .bind(vin.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("vehicle_reserved", e))
        })
    }

    fn save(
        &self,
        vehicles: &[PhysicalVehicle],
        request: Option<&TransferRequest>,
    ) -> Result<(), StoreError> {
        self.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_vehicle_save", e))?;

            for vehicle in vehicles {
                let body = body_to_json(vehicle)?;
                sqlx::query(
                    r#"
                    INSERT INTO vehicles (vin, variant_id, body, updated_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (vin) DO UPDATE
                    SET body = EXCLUDED.body, updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(vehicle.vin().as_str())
                .bind(vehicle.variant_id().get())
                .bind(body)
                .bind(vehicle.updated_at())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("save_vehicle", e))?;
            }

            if let Some(request) = request {
                let body = body_to_json(request)?;
                sqlx::query(
                    r#"
                    INSERT INTO transfer_requests (request_id, status, terminal, body, updated_at)
                    VALUES ($1, $2, $3, $4, NOW())
                    ON CONFLICT (request_id) DO UPDATE
                    SET status = EXCLUDED.status, terminal = EXCLUDED.terminal,
                        body = EXCLUDED.body, updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(request.request_id)
                .bind(format!("{:?}", request.status))
                .bind(request.status.is_terminal())
                .bind(body)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("save_transfer_request", e))?;
            }

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_vehicle_save", e))
        })
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("unexpected row not found in {operation}")),
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
