//! SQLite-backed repository
//!
//! - WAL mode so readers (reconcile, CLI queries) never block the writer
//! - Percentages stored as INTEGER fixed-point, timestamps as INTEGER micros
//! - `append` runs in one SQLite transaction with the venture version checked
//!   inside it, so a second process cannot interleave a commit

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{check_seq, LedgerRepository, RepoResult};
use crate::error::RepositoryError;
use crate::models::{
    Adjustment, AdjustmentOutcome, CapTableEntry, CapTableSnapshot, CapTableState, Contribution,
    ContributionStatus, ConversionOutcome, ConversionRecord, ConversionWindow, HolderType,
    LedgerTransaction, PeriodStatus, RebalancingPeriod, TokenBalance, TransactionKind, Venture,
    WindowStatus,
};
use crate::scoring::rules::Rule;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ventures (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    owner_min_pct INTEGER NOT NULL,
    alice_cap_pct INTEGER NOT NULL,
    reserve_pct INTEGER NOT NULL,
    flagged_for_review INTEGER NOT NULL DEFAULT 0,
    flag_reason TEXT,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    last_seq INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS cap_table_entries (
    venture_id TEXT NOT NULL REFERENCES ventures(id),
    holder_id TEXT NOT NULL,
    holder_type TEXT NOT NULL,
    pct INTEGER NOT NULL,
    source TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (venture_id, holder_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS genesis_entries (
    venture_id TEXT NOT NULL REFERENCES ventures(id),
    holder_id TEXT NOT NULL,
    holder_type TEXT NOT NULL,
    pct INTEGER NOT NULL,
    source TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (venture_id, holder_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ledger_transactions (
    id TEXT PRIMARY KEY,
    venture_id TEXT NOT NULL REFERENCES ventures(id),
    seq INTEGER NOT NULL,
    holder_id TEXT NOT NULL,
    holder_type TEXT NOT NULL,
    kind TEXT NOT NULL,
    before_pct INTEGER NOT NULL,
    after_pct INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    cause_ref TEXT NOT NULL,
    UNIQUE (venture_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_ledger_transactions_cause
    ON ledger_transactions(venture_id, cause_ref);

CREATE TABLE IF NOT EXISTS contributions (
    id TEXT PRIMARY KEY,
    contributor_id TEXT NOT NULL,
    venture_id TEXT NOT NULL,
    effort REAL NOT NULL,
    impact REAL NOT NULL,
    quality REAL NOT NULL,
    status TEXT NOT NULL,
    accepted_at INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_contributions_window
    ON contributions(venture_id, status, accepted_at);

CREATE TABLE IF NOT EXISTS rebalancing_periods (
    id TEXT PRIMARY KEY,
    venture_id TEXT NOT NULL,
    period_start INTEGER NOT NULL,
    period_end INTEGER NOT NULL,
    status TEXT NOT NULL,
    failure_reason TEXT,
    started_at INTEGER,
    finished_at INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_rebalancing_periods_status
    ON rebalancing_periods(venture_id, status);

CREATE TABLE IF NOT EXISTS adjustments (
    period_id TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    delta INTEGER NOT NULL,
    applied_at INTEGER NOT NULL,
    outcome TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_adjustments_period ON adjustments(period_id);

CREATE TABLE IF NOT EXISTS conversion_windows (
    id TEXT PRIMARY KEY,
    venture_id TEXT NOT NULL,
    opens_at INTEGER NOT NULL,
    closes_at INTEGER NOT NULL,
    equity_rate_bps INTEGER NOT NULL,
    status TEXT NOT NULL,
    eligibility_json TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_conversion_windows_venture
    ON conversion_windows(venture_id, opens_at);

CREATE TABLE IF NOT EXISTS conversion_records (
    window_id TEXT NOT NULL,
    venture_id TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    token_balance INTEGER NOT NULL,
    equity_delta INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversion_records_window ON conversion_records(window_id);

CREATE TABLE IF NOT EXISTS token_balances (
    venture_id TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    balance INTEGER NOT NULL,
    as_of INTEGER NOT NULL,
    PRIMARY KEY (venture_id, holder_id)
) WITHOUT ROWID;
"#;

#[derive(Clone)]
pub struct SqliteLedgerRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerRepository {
    pub fn open(db_path: impl AsRef<Path>) -> RepoResult<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)?;
        let repo = Self::init(conn)?;
        info!(path = %path.display(), "ledger database ready");
        Ok(repo)
    }

    pub fn open_in_memory() -> RepoResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> RepoResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_lowercase() != "wal" && journal_mode.to_lowercase() != "memory" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let stored: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .optional()?
            .flatten();
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(RepositoryError::Corrupt(format!(
                    "database schema v{} is newer than supported v{}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

// =============================================================================
// ROW MAPPING
// =============================================================================

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(ts)
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    Utc.timestamp_micros(micros)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let micros: Option<i64> = row.get(idx)?;
    micros
        .map(|m| {
            Utc.timestamp_micros(m)
                .single()
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, m))
        })
        .transpose()
}

fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_enum<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognized value {:?}", raw).into(),
        )
    })
}

fn venture_from_row(row: &Row<'_>) -> rusqlite::Result<Venture> {
    Ok(Venture {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        owner_min_pct: row.get(2)?,
        alice_cap_pct: row.get(3)?,
        reserve_pct: row.get(4)?,
        flagged_for_review: row.get::<_, i64>(5)? != 0,
        flag_reason: row.get(6)?,
        created_at: get_ts(row, 7)?,
    })
}

const VENTURE_COLUMNS: &str =
    "id, owner_id, owner_min_pct, alice_cap_pct, reserve_pct, flagged_for_review, flag_reason, created_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CapTableEntry> {
    Ok(CapTableEntry {
        venture_id: row.get(0)?,
        holder_id: row.get(1)?,
        holder_type: get_enum(row, 2, HolderType::parse)?,
        pct: row.get(3)?,
        source: row.get(4)?,
        updated_at: get_ts(row, 5)?,
    })
}

const ENTRY_COLUMNS: &str = "venture_id, holder_id, holder_type, pct, source, updated_at";

fn txn_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerTransaction> {
    Ok(LedgerTransaction {
        id: get_uuid(row, 0)?,
        venture_id: row.get(1)?,
        seq: row.get::<_, i64>(2)? as u64,
        holder_id: row.get(3)?,
        holder_type: get_enum(row, 4, HolderType::parse)?,
        kind: get_enum(row, 5, TransactionKind::parse)?,
        before_pct: row.get(6)?,
        after_pct: row.get(7)?,
        timestamp: get_ts(row, 8)?,
        cause_ref: row.get(9)?,
    })
}

const TXN_COLUMNS: &str =
    "id, venture_id, seq, holder_id, holder_type, kind, before_pct, after_pct, ts, cause_ref";

fn contribution_from_row(row: &Row<'_>) -> rusqlite::Result<Contribution> {
    Ok(Contribution {
        id: row.get(0)?,
        contributor_id: row.get(1)?,
        venture_id: row.get(2)?,
        effort: row.get(3)?,
        impact: row.get(4)?,
        quality: row.get(5)?,
        status: get_enum(row, 6, ContributionStatus::parse)?,
        accepted_at: get_opt_ts(row, 7)?,
    })
}

fn period_from_row(row: &Row<'_>) -> rusqlite::Result<RebalancingPeriod> {
    Ok(RebalancingPeriod {
        id: get_uuid(row, 0)?,
        venture_id: row.get(1)?,
        period_start: get_ts(row, 2)?,
        period_end: get_ts(row, 3)?,
        status: get_enum(row, 4, PeriodStatus::parse)?,
        failure_reason: row.get(5)?,
        started_at: get_opt_ts(row, 6)?,
        finished_at: get_opt_ts(row, 7)?,
    })
}

const PERIOD_COLUMNS: &str =
    "id, venture_id, period_start, period_end, status, failure_reason, started_at, finished_at";

fn window_from_row(row: &Row<'_>) -> rusqlite::Result<ConversionWindow> {
    let eligibility_json: Option<String> = row.get(6)?;
    let eligibility = eligibility_json
        .map(|json| {
            serde_json::from_str::<Rule>(&json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))
        })
        .transpose()?;
    Ok(ConversionWindow {
        id: get_uuid(row, 0)?,
        venture_id: row.get(1)?,
        opens_at: get_ts(row, 2)?,
        closes_at: get_ts(row, 3)?,
        equity_rate_bps: row.get::<_, i64>(4)? as u32,
        status: get_enum(row, 5, WindowStatus::parse)?,
        eligibility,
    })
}

const WINDOW_COLUMNS: &str =
    "id, venture_id, opens_at, closes_at, equity_rate_bps, status, eligibility_json";

fn insert_entries(conn: &Connection, table: &str, entries: &[CapTableEntry]) -> rusqlite::Result<()> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        table, ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    for e in entries {
        stmt.execute(params![
            e.venture_id,
            e.holder_id,
            e.holder_type.as_str(),
            e.pct,
            e.source,
            ts(e.updated_at),
        ])?;
    }
    Ok(())
}

fn upsert_period(conn: &Connection, p: &RebalancingPeriod) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO rebalancing_periods
            (id, venture_id, period_start, period_end, status, failure_reason, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            failure_reason = excluded.failure_reason,
            started_at = excluded.started_at,
            finished_at = excluded.finished_at",
        params![
            p.id.to_string(),
            p.venture_id,
            ts(p.period_start),
            ts(p.period_end),
            p.status.as_str(),
            p.failure_reason,
            opt_ts(p.started_at),
            opt_ts(p.finished_at),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl LedgerRepository for SqliteLedgerRepository {
    async fn create_venture(&self, venture: &Venture, genesis: &[CapTableEntry]) -> RepoResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM ventures WHERE id = ?1",
                params![venture.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(RepositoryError::AlreadyExists {
                what: "venture",
                id: venture.id.clone(),
            });
        }

        tx.execute(
            "INSERT INTO ventures
                (id, owner_id, owner_min_pct, alice_cap_pct, reserve_pct,
                 flagged_for_review, flag_reason, created_at, version, last_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0)",
            params![
                venture.id,
                venture.owner_id,
                venture.owner_min_pct,
                venture.alice_cap_pct,
                venture.reserve_pct,
                venture.flagged_for_review as i64,
                venture.flag_reason,
                ts(venture.created_at),
            ],
        )?;
        insert_entries(&tx, "cap_table_entries", genesis)?;
        insert_entries(&tx, "genesis_entries", genesis)?;
        tx.commit()?;
        Ok(())
    }

    async fn venture(&self, venture_id: &str) -> RepoResult<Option<Venture>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM ventures WHERE id = ?1", VENTURE_COLUMNS);
        Ok(conn
            .query_row(&sql, params![venture_id], venture_from_row)
            .optional()?)
    }

    async fn list_ventures(&self) -> RepoResult<Vec<Venture>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM ventures ORDER BY id", VENTURE_COLUMNS);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], venture_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn set_review_flag(&self, venture_id: &str, reason: Option<&str>) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE ventures SET flagged_for_review = ?2, flag_reason = ?3 WHERE id = ?1",
            params![venture_id, reason.is_some() as i64, reason],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound {
                what: "venture",
                id: venture_id.to_string(),
            });
        }
        Ok(())
    }

    async fn read_state(&self, venture_id: &str) -> RepoResult<CapTableSnapshot> {
        let conn = self.conn.lock().await;
        let (version, last_seq): (i64, i64) = conn
            .query_row(
                "SELECT version, last_seq FROM ventures WHERE id = ?1",
                params![venture_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                what: "venture",
                id: venture_id.to_string(),
            })?;

        let sql = format!(
            "SELECT {} FROM cap_table_entries WHERE venture_id = ?1 ORDER BY holder_id",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let entries = stmt
            .query_map(params![venture_id], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(CapTableSnapshot {
            state: CapTableState::from_entries(venture_id, entries),
            version: version as u64,
            last_seq: last_seq as u64,
        })
    }

    async fn append(
        &self,
        venture_id: &str,
        expected_version: u64,
        txns: &[LedgerTransaction],
    ) -> RepoResult<u64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let (version, last_seq): (i64, i64) = tx
            .query_row(
                "SELECT version, last_seq FROM ventures WHERE id = ?1",
                params![venture_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                what: "venture",
                id: venture_id.to_string(),
            })?;

        if version as u64 != expected_version {
            return Err(RepositoryError::VersionConflict {
                venture_id: venture_id.to_string(),
                expected: expected_version,
                actual: version as u64,
            });
        }
        check_seq(venture_id, last_seq as u64, txns)?;

        {
            let mut insert_txn = tx.prepare_cached(&format!(
                "INSERT INTO ledger_transactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                TXN_COLUMNS
            ))?;
            let mut upsert_entry = tx.prepare_cached(
                "INSERT INTO cap_table_entries
                    (venture_id, holder_id, holder_type, pct, source, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(venture_id, holder_id) DO UPDATE SET
                    pct = excluded.pct,
                    source = excluded.source,
                    updated_at = excluded.updated_at",
            )?;

            for t in txns {
                insert_txn.execute(params![
                    t.id.to_string(),
                    t.venture_id,
                    t.seq as i64,
                    t.holder_id,
                    t.holder_type.as_str(),
                    t.kind.as_str(),
                    t.before_pct,
                    t.after_pct,
                    ts(t.timestamp),
                    t.cause_ref,
                ])?;
                upsert_entry.execute(params![
                    t.venture_id,
                    t.holder_id,
                    t.holder_type.as_str(),
                    t.after_pct,
                    t.kind.as_str(),
                    ts(t.timestamp),
                ])?;
            }
        }

        let new_version = version + 1;
        let changed = tx.execute(
            "UPDATE ventures SET version = ?2, last_seq = ?3 WHERE id = ?1 AND version = ?4",
            params![
                venture_id,
                new_version,
                last_seq + txns.len() as i64,
                version
            ],
        )?;
        if changed != 1 {
            return Err(RepositoryError::VersionConflict {
                venture_id: venture_id.to_string(),
                expected: expected_version,
                actual: version as u64 + 1,
            });
        }
        tx.commit()?;
        Ok(new_version as u64)
    }

    async fn genesis(&self, venture_id: &str) -> RepoResult<Vec<CapTableEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM genesis_entries WHERE venture_id = ?1 ORDER BY holder_id",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![venture_id], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn transactions(
        &self,
        venture_id: &str,
        upto: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<LedgerTransaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM ledger_transactions
             WHERE venture_id = ?1 AND ts <= ?2
             ORDER BY seq ASC",
            TXN_COLUMNS
        );
        let cutoff = upto.map(ts).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![venture_id, cutoff], txn_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn has_transactions_for(&self, venture_id: &str, cause_ref: &str) -> RepoResult<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ledger_transactions WHERE venture_id = ?1 AND cause_ref = ?2 LIMIT 1",
                params![venture_id, cause_ref],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn transactions_for(
        &self,
        venture_id: &str,
        cause_ref: &str,
    ) -> RepoResult<Vec<LedgerTransaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM ledger_transactions
             WHERE venture_id = ?1 AND cause_ref = ?2
             ORDER BY seq ASC",
            TXN_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![venture_id, cause_ref], txn_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn insert_contribution(&self, c: &Contribution) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO contributions
                (id, contributor_id, venture_id, effort, impact, quality, status, accepted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                c.id,
                c.contributor_id,
                c.venture_id,
                c.effort,
                c.impact,
                c.quality,
                c.status.as_str(),
                opt_ts(c.accepted_at),
            ],
        )?;
        if inserted == 0 {
            return Err(RepositoryError::AlreadyExists {
                what: "contribution",
                id: c.id.clone(),
            });
        }
        Ok(())
    }

    async fn approved_contributions(
        &self,
        venture_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RepoResult<Vec<Contribution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, contributor_id, venture_id, effort, impact, quality, status, accepted_at
             FROM contributions
             WHERE venture_id = ?1 AND status = 'APPROVED'
               AND accepted_at >= ?2 AND accepted_at < ?3
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![venture_id, ts(start), ts(end)], contribution_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn period(&self, period_id: Uuid) -> RepoResult<Option<RebalancingPeriod>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM rebalancing_periods WHERE id = ?1", PERIOD_COLUMNS);
        Ok(conn
            .query_row(&sql, params![period_id.to_string()], period_from_row)
            .optional()?)
    }

    async fn save_period(&self, period: &RebalancingPeriod) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        upsert_period(&conn, period)?;
        Ok(())
    }

    async fn try_begin_period(&self, period: &RebalancingPeriod) -> RepoResult<Option<Uuid>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let busy: Option<String> = tx
            .query_row(
                "SELECT id FROM rebalancing_periods
                 WHERE venture_id = ?1 AND status = 'RUNNING'
                 LIMIT 1",
                params![period.venture_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(raw) = busy {
            let id = Uuid::parse_str(&raw)
                .map_err(|e| RepositoryError::Corrupt(format!("period id {}: {}", raw, e)))?;
            return Ok(Some(id));
        }

        upsert_period(&tx, period)?;
        tx.commit()?;
        Ok(None)
    }

    async fn running_periods(&self, venture_id: Option<&str>) -> RepoResult<Vec<RebalancingPeriod>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM rebalancing_periods
             WHERE status = 'RUNNING' AND (?1 IS NULL OR venture_id = ?1)
             ORDER BY venture_id, period_start",
            PERIOD_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![venture_id], period_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn record_adjustments(&self, adjustments: &[Adjustment]) -> RepoResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO adjustments (period_id, holder_id, delta, applied_at, outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for a in adjustments {
                stmt.execute(params![
                    a.period_id.to_string(),
                    a.holder_id,
                    a.delta,
                    ts(a.applied_at),
                    a.outcome.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn adjustments(&self, period_id: Uuid) -> RepoResult<Vec<Adjustment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT period_id, holder_id, delta, applied_at, outcome
             FROM adjustments WHERE period_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![period_id.to_string()], |row| {
            Ok(Adjustment {
                period_id: get_uuid(row, 0)?,
                holder_id: row.get(1)?,
                delta: row.get(2)?,
                applied_at: get_ts(row, 3)?,
                outcome: get_enum(row, 4, AdjustmentOutcome::parse)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn save_window(&self, w: &ConversionWindow) -> RepoResult<()> {
        let eligibility_json = w
            .eligibility
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversion_windows
                (id, venture_id, opens_at, closes_at, equity_rate_bps, status, eligibility_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                opens_at = excluded.opens_at,
                closes_at = excluded.closes_at,
                equity_rate_bps = excluded.equity_rate_bps,
                status = excluded.status,
                eligibility_json = excluded.eligibility_json",
            params![
                w.id.to_string(),
                w.venture_id,
                ts(w.opens_at),
                ts(w.closes_at),
                w.equity_rate_bps as i64,
                w.status.as_str(),
                eligibility_json,
            ],
        )?;
        Ok(())
    }

    async fn window(&self, window_id: Uuid) -> RepoResult<Option<ConversionWindow>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM conversion_windows WHERE id = ?1", WINDOW_COLUMNS);
        Ok(conn
            .query_row(&sql, params![window_id.to_string()], window_from_row)
            .optional()?)
    }

    async fn windows(&self, venture_id: Option<&str>) -> RepoResult<Vec<ConversionWindow>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM conversion_windows
             WHERE (?1 IS NULL OR venture_id = ?1)
             ORDER BY opens_at, id",
            WINDOW_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![venture_id], window_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn record_conversions(&self, records: &[ConversionRecord]) -> RepoResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO conversion_records
                    (window_id, venture_id, holder_id, token_balance, equity_delta, outcome, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.window_id.to_string(),
                    r.venture_id,
                    r.holder_id,
                    r.token_balance,
                    r.equity_delta,
                    r.outcome.as_str(),
                    ts(r.recorded_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn conversion_records(&self, window_id: Uuid) -> RepoResult<Vec<ConversionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT window_id, venture_id, holder_id, token_balance, equity_delta, outcome, recorded_at
             FROM conversion_records WHERE window_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![window_id.to_string()], |row| {
            Ok(ConversionRecord {
                window_id: get_uuid(row, 0)?,
                venture_id: row.get(1)?,
                holder_id: row.get(2)?,
                token_balance: row.get(3)?,
                equity_delta: row.get(4)?,
                outcome: get_enum(row, 5, ConversionOutcome::parse)?,
                recorded_at: get_ts(row, 6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn upsert_token_balance(&self, b: &TokenBalance) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO token_balances (venture_id, holder_id, balance, as_of)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(venture_id, holder_id) DO UPDATE SET
                balance = excluded.balance,
                as_of = excluded.as_of",
            params![b.venture_id, b.holder_id, b.balance, ts(b.as_of)],
        )?;
        Ok(())
    }

    async fn token_balances(&self, venture_id: &str) -> RepoResult<Vec<TokenBalance>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT venture_id, holder_id, balance, as_of
             FROM token_balances WHERE venture_id = ?1 ORDER BY holder_id",
        )?;
        let rows = stmt.query_map(params![venture_id], |row| {
            Ok(TokenBalance {
                venture_id: row.get(0)?,
                holder_id: row.get(1)?,
                balance: row.get(2)?,
                as_of: get_ts(row, 3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
