use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;

/// The database mutex was poisoned by a panic on a blocking thread.
#[derive(Debug, thiserror::Error)]
#[error("DB lock poisoned")]
pub struct LockPoisoned;

/// Appending a stage would push its display order past `MAX_STAGE_ORDER`.
#[derive(Debug, thiserror::Error)]
#[error("Tenant {tenant_id} has no stage order left after {max_order}")]
pub struct StageOrderExhausted {
    pub tenant_id: String,
    pub max_order: i32,
}

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| anyhow::Error::new(LockPoisoned))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CrmDb>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::Error::new(LockPoisoned))
    }
}

/// Result of a stage move attempted inside one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    Moved {
        previous_stage_id: String,
        lead: LeadRow,
    },
    /// Lead missing or owned by another tenant.
    LeadNotFound,
    /// Stage missing or owned by another tenant.
    StageNotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageDeletion {
    Deleted,
    NotFound,
    HasLeads(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionInsert {
    Inserted(TransactionRecord),
    /// A record with the same processor reference already exists.
    Duplicate,
}

/// Fields for a new lead row; the stage is resolved by the caller.
#[derive(Debug, Clone)]
pub struct NewLead {
    pub tenant_id: String,
    pub stage_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub estimated_value: Option<Decimal>,
    pub source: LeadSource,
}

const LEAD_COLUMNS: &str = "id, tenant_id, name, email, phone, stage_id, estimated_value, params, stage_entered_at, created_at, updated_at";

const STAGE_COLUMNS: &str = "id, tenant_id, name, display_order, status, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, tenant_id, occurred_at, concept, gross_amount, currency, processor_fee, platform_fee, net_amount, payment_method, processor_reference, payer_email, payer_name, status, origin_id, origin_type, metadata, created_at";

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Run raw SQL against the connection; lets tests break the schema.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("Failed to execute raw SQL")
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tenants (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    email TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stages (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    display_order INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(tenant_id, name)
                );

                CREATE TABLE IF NOT EXISTS leads (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    email TEXT,
                    phone TEXT,
                    stage_id TEXT NOT NULL REFERENCES stages(id),
                    estimated_value TEXT,
                    params TEXT NOT NULL DEFAULT '{}',
                    stage_entered_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tags (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    color TEXT,
                    UNIQUE(tenant_id, name)
                );

                CREATE TABLE IF NOT EXISTS lead_tags (
                    lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                    tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                    assigned_at TEXT NOT NULL,
                    PRIMARY KEY (lead_id, tag_id)
                );

                CREATE TABLE IF NOT EXISTS lead_schedule (
                    lead_id TEXT PRIMARY KEY REFERENCES leads(id) ON DELETE CASCADE,
                    next_appointment_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS transactions (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id),
                    occurred_at TEXT NOT NULL,
                    concept TEXT NOT NULL,
                    gross_amount TEXT NOT NULL,
                    currency TEXT NOT NULL,
                    processor_fee TEXT NOT NULL,
                    platform_fee TEXT NOT NULL,
                    net_amount TEXT NOT NULL,
                    payment_method TEXT NOT NULL,
                    processor_reference TEXT NOT NULL UNIQUE,
                    payer_email TEXT,
                    payer_name TEXT,
                    status TEXT NOT NULL,
                    origin_id TEXT,
                    origin_type TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS payment_accounts (
                    tenant_id TEXT PRIMARY KEY REFERENCES tenants(id) ON DELETE CASCADE,
                    provider_account_id TEXT NOT NULL UNIQUE,
                    charges_enabled INTEGER NOT NULL DEFAULT 0,
                    payouts_enabled INTEGER NOT NULL DEFAULT 0,
                    onboarding_complete INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_stages_tenant ON stages(tenant_id, display_order);
                CREATE INDEX IF NOT EXISTS idx_leads_tenant ON leads(tenant_id);
                CREATE INDEX IF NOT EXISTS idx_leads_stage ON leads(stage_id);
                CREATE INDEX IF NOT EXISTS idx_transactions_tenant ON transactions(tenant_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Tenants ───────────────────────────────────────────────────────

    pub fn create_tenant(&self, name: &str, email: Option<&str>) -> Result<Tenant> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO tenants (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, name, email, Utc::now()],
            )
            .context("Failed to insert tenant")?;
        self.get_tenant(&id)?
            .context("Tenant not found after insert")
    }

    pub fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        self.conn
            .query_row(
                "SELECT id, name, email, created_at FROM tenants WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Tenant {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query tenant")
    }

    // ── Stage directory ───────────────────────────────────────────────

    /// All stages of a tenant (any status), in display order.
    pub fn list_stages(&self, tenant_id: &str) -> Result<Vec<Stage>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STAGE_COLUMNS} FROM stages WHERE tenant_id = ?1 ORDER BY display_order, id"
            ))
            .context("Failed to prepare list_stages")?;
        let rows = stmt
            .query_map(params![tenant_id], stage_row)
            .context("Failed to query stages")?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row.context("Failed to read stage row")?);
        }
        Ok(stages)
    }

    pub fn get_stage(&self, id: &str) -> Result<Option<Stage>> {
        self.conn
            .query_row(
                &format!("SELECT {STAGE_COLUMNS} FROM stages WHERE id = ?1"),
                params![id],
                stage_row,
            )
            .optional()
            .context("Failed to query stage")
    }

    /// Append a stage after the tenant's last one. Returns `None` when the
    /// tenant already has a stage with that name, and `StageOrderExhausted`
    /// when no order is left after the last stage.
    pub fn create_stage(&self, tenant_id: &str, name: &str) -> Result<Option<Stage>> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM stages WHERE tenant_id = ?1 AND name = ?2",
                params![tenant_id, name],
                |row| row.get(0),
            )
            .context("Failed to check stage name")?;
        if exists {
            return Ok(None);
        }

        let max_order: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(display_order), 0) FROM stages WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .context("Failed to get max stage order")?;
        let order = max_order
            .checked_add(1)
            .filter(|o| *o <= MAX_STAGE_ORDER)
            .ok_or_else(|| {
                anyhow::Error::new(StageOrderExhausted {
                    tenant_id: tenant_id.to_string(),
                    max_order,
                })
            })?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO stages (id, tenant_id, name, display_order, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
                params![id, tenant_id, name, order, now],
            )
            .context("Failed to insert stage")?;
        self.get_stage(&id)
    }

    /// Rename and/or change the status of a stage. Returns `Ok(None)` when
    /// the stage does not exist.
    pub fn update_stage(
        &self,
        id: &str,
        name: Option<&str>,
        status: Option<StageStatus>,
    ) -> Result<Option<Stage>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = Utc::now();
        if let Some(n) = name {
            tx.execute(
                "UPDATE stages SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![n, now, id],
            )
            .context("Failed to rename stage")?;
        }
        if let Some(s) = status {
            tx.execute(
                "UPDATE stages SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![s.as_str(), now, id],
            )
            .context("Failed to update stage status")?;
        }
        tx.commit().context("Failed to commit stage update")?;
        self.get_stage(id)
    }

    pub fn delete_stage(&self, id: &str) -> Result<StageDeletion> {
        if self.get_stage(id)?.is_none() {
            return Ok(StageDeletion::NotFound);
        }
        let lead_count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM leads WHERE stage_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to count stage leads")?;
        if lead_count > 0 {
            return Ok(StageDeletion::HasLeads(lead_count));
        }
        self.conn
            .execute("DELETE FROM stages WHERE id = ?1", params![id])
            .context("Failed to delete stage")?;
        Ok(StageDeletion::Deleted)
    }

    /// Apply new display orders atomically. Returns `false` (and changes
    /// nothing) if any stage does not belong to the tenant.
    pub fn reorder_stages(&self, tenant_id: &str, orders: &[(String, i32)]) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = Utc::now();
        for (stage_id, order) in orders {
            let updated = tx
                .execute(
                    "UPDATE stages SET display_order = ?1, updated_at = ?2 WHERE id = ?3 AND tenant_id = ?4",
                    params![order, now, stage_id, tenant_id],
                )
                .context("Failed to update stage order")?;
            if updated == 0 {
                // Dropping `tx` rolls back.
                return Ok(false);
            }
        }
        tx.commit().context("Failed to commit stage reorder")?;
        Ok(true)
    }

    /// The tenant's default intake stage: first active stage by order.
    pub fn first_active_stage(&self, tenant_id: &str) -> Result<Option<Stage>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {STAGE_COLUMNS} FROM stages
                     WHERE tenant_id = ?1 AND status = 'active'
                     ORDER BY display_order, id LIMIT 1"
                ),
                params![tenant_id],
                stage_row,
            )
            .optional()
            .context("Failed to query intake stage")
    }

    // ── Lead store ────────────────────────────────────────────────────

    pub fn insert_lead(&self, lead: &NewLead, now: DateTime<Utc>) -> Result<LeadRow> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                &format!(
                    "INSERT INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?9)"
                ),
                params![
                    id,
                    lead.tenant_id,
                    lead.name,
                    lead.email,
                    lead.phone,
                    lead.stage_id,
                    lead.estimated_value.map(|v| v.to_string()),
                    lead.source.to_value(),
                    now,
                ],
            )
            .context("Failed to insert lead")?;
        self.get_lead_row(&id)?
            .context("Lead not found after insert")
    }

    pub fn get_lead_row(&self, id: &str) -> Result<Option<LeadRow>> {
        self.conn
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id],
                lead_row,
            )
            .optional()
            .context("Failed to query lead")
    }

    /// Full lead with tags and scheduling.
    pub fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        let Some(row) = self.get_lead_row(id)? else {
            return Ok(None);
        };
        let tags = self.lead_tags(id)?;
        let next_appointment_at = self.next_appointment(id)?;
        Ok(Some(row.into_lead(tags, next_appointment_at)))
    }

    /// Reassign a lead's stage. Validation and update run in one
    /// transaction so the stage cannot disappear between check and write.
    pub fn move_lead(
        &self,
        lead_id: &str,
        stage_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MoveOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT tenant_id, stage_id FROM leads WHERE id = ?1",
                params![lead_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read lead for move")?;
        let previous_stage_id = match current {
            Some((lead_tenant, stage)) if lead_tenant == tenant_id => stage,
            _ => return Ok(MoveOutcome::LeadNotFound),
        };

        let stage_tenant: Option<String> = tx
            .query_row(
                "SELECT tenant_id FROM stages WHERE id = ?1",
                params![stage_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read stage for move")?;
        if stage_tenant.as_deref() != Some(tenant_id) {
            return Ok(MoveOutcome::StageNotFound);
        }

        if previous_stage_id == stage_id {
            tx.execute(
                "UPDATE leads SET updated_at = ?1 WHERE id = ?2",
                params![now, lead_id],
            )
            .context("Failed to touch lead")?;
        } else {
            tx.execute(
                "UPDATE leads SET stage_id = ?1, stage_entered_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![stage_id, now, lead_id],
            )
            .context("Failed to move lead")?;
        }

        let lead = tx
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![lead_id],
                lead_row,
            )
            .context("Lead not found after move")?;
        tx.commit().context("Failed to commit lead move")?;

        Ok(MoveOutcome::Moved {
            previous_stage_id,
            lead,
        })
    }

    pub fn count_leads(&self, tenant_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM leads WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .context("Failed to count leads")
    }

    // ── Tags and scheduling ───────────────────────────────────────────

    /// Returns `None` when the tenant already has a tag with that name.
    pub fn create_tag(&self, tenant_id: &str, name: &str, color: Option<&str>) -> Result<Option<Tag>> {
        let id = Uuid::new_v4().to_string();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO tags (id, tenant_id, name, color) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant_id, name) DO NOTHING",
                params![id, tenant_id, name, color],
            )
            .context("Failed to insert tag")?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(Tag {
            id,
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            color: color.map(str::to_string),
        }))
    }

    pub fn get_tag(&self, id: &str) -> Result<Option<Tag>> {
        self.conn
            .query_row(
                "SELECT id, tenant_id, name, color FROM tags WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Tag {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        name: row.get(2)?,
                        color: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query tag")
    }

    /// Replace the lead's tag set. Callers validate tenant ownership first.
    pub fn set_lead_tags(&self, lead_id: &str, tag_ids: &[String]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute("DELETE FROM lead_tags WHERE lead_id = ?1", params![lead_id])
            .context("Failed to clear lead tags")?;
        let now = Utc::now();
        for tag_id in tag_ids {
            tx.execute(
                "INSERT OR IGNORE INTO lead_tags (lead_id, tag_id, assigned_at) VALUES (?1, ?2, ?3)",
                params![lead_id, tag_id, now],
            )
            .context("Failed to assign tag")?;
        }
        tx.execute(
            "UPDATE leads SET updated_at = ?1 WHERE id = ?2",
            params![now, lead_id],
        )
        .context("Failed to touch lead")?;
        tx.commit().context("Failed to commit lead tags")?;
        Ok(())
    }

    fn lead_tags(&self, lead_id: &str) -> Result<Vec<TagSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.id, t.name, t.color FROM lead_tags lt
                 JOIN tags t ON t.id = lt.tag_id
                 WHERE lt.lead_id = ?1 ORDER BY lt.assigned_at, t.name",
            )
            .context("Failed to prepare lead_tags")?;
        let rows = stmt
            .query_map(params![lead_id], |row| {
                Ok(TagSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    color: row.get(2)?,
                })
            })
            .context("Failed to query lead tags")?;
        let mut tags = Vec::new();
        for row in rows {
            tags.push(row.context("Failed to read tag row")?);
        }
        Ok(tags)
    }

    pub fn set_next_appointment(&self, lead_id: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        match at {
            Some(at) => self
                .conn
                .execute(
                    "INSERT INTO lead_schedule (lead_id, next_appointment_at) VALUES (?1, ?2)
                     ON CONFLICT(lead_id) DO UPDATE SET next_appointment_at = ?2",
                    params![lead_id, at],
                )
                .context("Failed to set next appointment")?,
            None => self
                .conn
                .execute(
                    "DELETE FROM lead_schedule WHERE lead_id = ?1",
                    params![lead_id],
                )
                .context("Failed to clear next appointment")?,
        };
        Ok(())
    }

    fn next_appointment(&self, lead_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.conn
            .query_row(
                "SELECT next_appointment_at FROM lead_schedule WHERE lead_id = ?1",
                params![lead_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query next appointment")
    }

    // ── Board projection ──────────────────────────────────────────────

    /// Active stages in display order, each with its leads newest-updated
    /// first and at most `tag_limit` tags per card.
    pub fn load_board(&self, tenant_id: &str, tag_limit: usize) -> Result<BoardProjection> {
        let mut columns: Vec<BoardColumn> = self
            .list_stages(tenant_id)?
            .into_iter()
            .filter(|s| s.status == StageStatus::Active)
            .map(|s| BoardColumn {
                stage_id: s.id,
                name: s.name,
                order: s.order,
                leads: Vec::new(),
            })
            .collect();

        let mut tags_by_lead: HashMap<String, Vec<TagSummary>> = HashMap::new();
        {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT lt.lead_id, t.id, t.name, t.color FROM lead_tags lt
                     JOIN tags t ON t.id = lt.tag_id
                     WHERE t.tenant_id = ?1 ORDER BY lt.assigned_at, t.name",
                )
                .context("Failed to prepare board tags")?;
            let rows = stmt
                .query_map(params![tenant_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        TagSummary {
                            id: row.get(1)?,
                            name: row.get(2)?,
                            color: row.get(3)?,
                        },
                    ))
                })
                .context("Failed to query board tags")?;
            for row in rows {
                let (lead_id, tag) = row.context("Failed to read board tag row")?;
                let tags = tags_by_lead.entry(lead_id).or_default();
                if tags.len() < tag_limit {
                    tags.push(tag);
                }
            }
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT l.id, l.tenant_id, l.name, l.email, l.phone, l.stage_id, l.estimated_value,
                        l.params, l.stage_entered_at, l.created_at, l.updated_at, s.next_appointment_at
                 FROM leads l LEFT JOIN lead_schedule s ON s.lead_id = l.id
                 WHERE l.tenant_id = ?1
                 ORDER BY l.updated_at DESC, l.id",
            )
            .context("Failed to prepare board leads")?;
        let rows = stmt
            .query_map(params![tenant_id], |row| {
                Ok((lead_row(row)?, row.get::<_, Option<DateTime<Utc>>>(11)?))
            })
            .context("Failed to query board leads")?;
        for row in rows {
            let (lead, next_appointment_at) = row.context("Failed to read board lead row")?;
            let Some(column) = columns.iter_mut().find(|c| c.stage_id == lead.stage_id) else {
                // Lead sits in an inactive stage.
                continue;
            };
            let mut summary = lead.to_summary();
            summary.tags = tags_by_lead.remove(&lead.id).unwrap_or_default();
            summary.next_appointment_at = next_appointment_at;
            column.leads.push(summary);
        }

        Ok(BoardProjection {
            tenant_id: tenant_id.to_string(),
            columns,
        })
    }

    // ── Transactions ──────────────────────────────────────────────────

    pub fn find_transaction_by_reference(&self, reference: &str) -> Result<Option<TransactionRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE processor_reference = ?1"
                ),
                params![reference],
                transaction_row,
            )
            .optional()
            .context("Failed to query transaction")
    }

    /// Insert keyed by processor reference. A uniqueness conflict is
    /// reported as `Duplicate`, never as an error.
    pub fn insert_transaction(&self, tx_in: &NewTransaction) -> Result<TransactionInsert> {
        let id = Uuid::new_v4().to_string();
        let metadata =
            serde_json::to_string(&tx_in.metadata).context("Failed to encode metadata")?;
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO transactions ({TRANSACTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                     ON CONFLICT(processor_reference) DO NOTHING"
                ),
                params![
                    id,
                    tx_in.tenant_id,
                    tx_in.occurred_at,
                    tx_in.concept,
                    tx_in.gross_amount.to_string(),
                    tx_in.currency,
                    tx_in.processor_fee.to_string(),
                    tx_in.platform_fee.to_string(),
                    tx_in.net_amount.to_string(),
                    tx_in.payment_method,
                    tx_in.processor_reference,
                    tx_in.payer_email,
                    tx_in.payer_name,
                    tx_in.status.as_str(),
                    tx_in.origin_id,
                    tx_in.origin_type,
                    metadata,
                    Utc::now(),
                ],
            )
            .context("Failed to insert transaction")?;
        if inserted == 0 {
            return Ok(TransactionInsert::Duplicate);
        }
        let record = self
            .find_transaction_by_reference(&tx_in.processor_reference)?
            .context("Transaction not found after insert")?;
        Ok(TransactionInsert::Inserted(record))
    }

    pub fn count_transactions(&self, tenant_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM transactions WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .context("Failed to count transactions")
    }

    // ── Payment accounts ──────────────────────────────────────────────

    pub fn link_payment_account(&self, tenant_id: &str, provider_account_id: &str) -> Result<PaymentAccount> {
        self.conn
            .execute(
                "INSERT INTO payment_accounts (tenant_id, provider_account_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tenant_id) DO UPDATE SET provider_account_id = ?2, updated_at = ?3",
                params![tenant_id, provider_account_id, Utc::now()],
            )
            .context("Failed to link payment account")?;
        self.get_payment_account(provider_account_id)?
            .context("Payment account not found after link")
    }

    pub fn get_payment_account(&self, provider_account_id: &str) -> Result<Option<PaymentAccount>> {
        self.conn
            .query_row(
                "SELECT tenant_id, provider_account_id, charges_enabled, payouts_enabled, onboarding_complete
                 FROM payment_accounts WHERE provider_account_id = ?1",
                params![provider_account_id],
                |row| {
                    Ok(PaymentAccount {
                        tenant_id: row.get(0)?,
                        provider_account_id: row.get(1)?,
                        charges_enabled: row.get(2)?,
                        payouts_enabled: row.get(3)?,
                        onboarding_complete: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query payment account")
    }

    /// Returns `None` when no tenant is linked to the provider account.
    pub fn update_payment_account_flags(
        &self,
        provider_account_id: &str,
        charges_enabled: bool,
        payouts_enabled: bool,
        onboarding_complete: bool,
    ) -> Result<Option<PaymentAccount>> {
        let updated = self
            .conn
            .execute(
                "UPDATE payment_accounts
                 SET charges_enabled = ?1, payouts_enabled = ?2, onboarding_complete = ?3, updated_at = ?4
                 WHERE provider_account_id = ?5",
                params![
                    charges_enabled,
                    payouts_enabled,
                    onboarding_complete,
                    Utc::now(),
                    provider_account_id
                ],
            )
            .context("Failed to update payment account")?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_payment_account(provider_account_id)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

fn stage_row(row: &Row<'_>) -> rusqlite::Result<Stage> {
    let status: String = row.get(4)?;
    Ok(Stage {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        order: row.get(3)?,
        status: StageStatus::from_str(&status).map_err(|e| conversion_error(4, e))?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn lead_row(row: &Row<'_>) -> rusqlite::Result<LeadRow> {
    Ok(LeadRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        stage_id: row.get(5)?,
        estimated_value: row.get(6)?,
        params: row.get(7)?,
        stage_entered_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn transaction_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let status: String = row.get(13)?;
    let metadata: String = row.get(16)?;
    Ok(TransactionRecord {
        id: row.get(0)?,
        details: NewTransaction {
            tenant_id: row.get(1)?,
            occurred_at: row.get(2)?,
            concept: row.get(3)?,
            gross_amount: decimal_col(row, 4)?,
            currency: row.get(5)?,
            processor_fee: decimal_col(row, 6)?,
            platform_fee: decimal_col(row, 7)?,
            net_amount: decimal_col(row, 8)?,
            payment_method: row.get(9)?,
            processor_reference: row.get(10)?,
            payer_email: row.get(11)?,
            payer_name: row.get(12)?,
            status: TransactionStatus::from_str(&status).map_err(|e| conversion_error(13, e))?,
            origin_id: row.get(14)?,
            origin_type: row.get(15)?,
            metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata)
                .map_err(|e| conversion_error(16, e.to_string()))?,
        },
        created_at: row.get(17)?,
    })
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(message),
    )
}
