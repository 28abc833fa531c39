//! Anchor Receipt Store
//!
//! SQLite-backed persistence for anchor outcomes, keyed by `(entity_type, entity_id)`.
//! A row holds either the full [`AnchorReceipt`] (including the Merkle root, proof and
//! batch id for batched anchors) or an `anchoring_failed` marker with the last error.
//! Verification reads these rows long after the in-memory batch is gone.

use crate::digest::Digest;
use crate::error::{CoreError, Result};
use crate::types::{AnchorReceipt, EntityRef, EventCategory};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Anchoring state of a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Anchored,
    AnchoringFailed,
}

impl ReceiptStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Anchored => "anchored",
            ReceiptStatus::AnchoringFailed => "anchoring_failed",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "anchored" => Ok(ReceiptStatus::Anchored),
            "anchoring_failed" => Ok(ReceiptStatus::AnchoringFailed),
            other => Err(CoreError::Codec(format!("unknown receipt status: {}", other))),
        }
    }
}

/// A row read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReceipt {
    pub entity: EntityRef,
    pub category: EventCategory,
    pub digest: Digest,
    pub status: ReceiptStatus,
    pub receipt: Option<AnchorReceipt>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Store counters
#[derive(Debug, Default, Clone)]
pub struct ReceiptStoreMetrics {
    pub receipts_recorded_total: u64,
    pub failures_recorded_total: u64,
}

/// SQLite receipt store. Safe to share behind an `Arc`.
pub struct ReceiptStore {
    conn: Mutex<Connection>,
    metrics: Mutex<ReceiptStoreMetrics>,
}

impl ReceiptStore {
    /// Create or open a store at the specified path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening receipt store");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::from_connection(conn)
    }

    /// Volatile store, used by tests and local runs
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            metrics: Mutex::new(ReceiptStoreMetrics::default()),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS anchor_receipts (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                category TEXT NOT NULL,
                digest TEXT NOT NULL,
                status TEXT NOT NULL,
                receipt_json TEXT,
                merkle_root TEXT,
                batch_id TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            );

            CREATE INDEX IF NOT EXISTS idx_receipts_status ON anchor_receipts(status);
            CREATE INDEX IF NOT EXISTS idx_receipts_batch ON anchor_receipts(batch_id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Io(std::io::Error::other("receipt store lock poisoned")))
    }

    fn bump(&self, f: impl FnOnce(&mut ReceiptStoreMetrics)) {
        if let Ok(mut metrics) = self.metrics.lock() {
            f(&mut metrics);
        }
    }

    /// Persist a successful anchor, replacing any earlier row for the entity
    pub fn record_receipt(
        &self,
        entity: &EntityRef,
        category: EventCategory,
        digest: &Digest,
        receipt: &AnchorReceipt,
    ) -> Result<()> {
        let receipt_json = serde_json::to_string(receipt)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO anchor_receipts (
                entity_type, entity_id, category, digest, status,
                receipt_json, merkle_root, batch_id, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9)
            "#,
            params![
                entity.entity_type,
                entity.entity_id,
                category.as_str(),
                digest.as_str(),
                ReceiptStatus::Anchored.as_str(),
                receipt_json,
                receipt.merkle_root.as_ref().map(|r| r.as_str().to_string()),
                receipt.batch_id.map(|id| id.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        drop(conn);

        self.bump(|m| m.receipts_recorded_total += 1);
        debug!(
            entity = %entity,
            transaction_id = %receipt.ledger_transaction_id,
            batched = receipt.is_batched(),
            "Receipt recorded"
        );
        Ok(())
    }

    /// Mark an entity as permanently failed to anchor
    pub fn mark_failed(
        &self,
        entity: &EntityRef,
        category: EventCategory,
        digest: &Digest,
        error: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO anchor_receipts (
                entity_type, entity_id, category, digest, status,
                receipt_json, merkle_root, batch_id, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, ?7)
            "#,
            params![
                entity.entity_type,
                entity.entity_id,
                category.as_str(),
                digest.as_str(),
                ReceiptStatus::AnchoringFailed.as_str(),
                error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        drop(conn);

        self.bump(|m| m.failures_recorded_total += 1);
        warn!(entity = %entity, error = %error, "Entity marked anchoring_failed");
        Ok(())
    }

    /// Load the row for an entity
    pub fn get(&self, entity: &EntityRef) -> Result<Option<StoredReceipt>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT category, digest, status, receipt_json, last_error, updated_at
            FROM anchor_receipts
            WHERE entity_type = ?1 AND entity_id = ?2
            "#,
        )?;

        let row = stmt
            .query_row(params![entity.entity_type, entity.entity_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()?;

        let Some((category, digest, status, receipt_json, last_error, updated_at)) = row else {
            return Ok(None);
        };

        let receipt = receipt_json
            .map(|json| serde_json::from_str::<AnchorReceipt>(&json))
            .transpose()?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CoreError::Codec(format!("bad updated_at: {}", e)))?;

        Ok(Some(StoredReceipt {
            entity: entity.clone(),
            category: category.parse()?,
            digest: Digest::from_hex(digest)?,
            status: ReceiptStatus::parse(&status)?,
            receipt,
            last_error,
            updated_at,
        }))
    }

    /// Number of rows in a given status
    pub fn count_by_status(&self, status: ReceiptStatus) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM anchor_receipts WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Entities anchored as part of a batch
    pub fn entities_in_batch(&self, batch_id: &uuid::Uuid) -> Result<Vec<EntityRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_type, entity_id FROM anchor_receipts WHERE batch_id = ?1 ORDER BY entity_type, entity_id",
        )?;
        let rows = stmt.query_map([batch_id.to_string()], |row| {
            Ok(EntityRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn metrics(&self) -> ReceiptStoreMetrics {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}
