use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::{sync::Mutex, time::Duration};

use crate::types::{
    ApprovalRequest, ApprovalStatus, ProblemReport, RepairAction, RepairLevel, RepairRecord,
};

const SCHEMA_SQL: &str = include_str!("../schema.sql");

pub const DEFAULT_REPAIR_LOG_CAP: usize = 500;

/// Shared store: the inbound problem queue, approval decisions and the
/// persisted repair log.
pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let level: u8 = row.get(1)?;
    let action: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let resolved_at: Option<String> = row.get(6)?;
    Ok(ApprovalRequest {
        request_id: row.get(0)?,
        level: RepairLevel::from_u8(level).unwrap_or(RepairLevel::Approve),
        description: row.get(2)?,
        action: RepairAction::parse(&action).unwrap_or(RepairAction::NotifyAdmin),
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
        created_at: parse_ts(&created_at),
        resolved_at: resolved_at.as_deref().map(parse_ts),
    })
}

const APPROVAL_COLUMNS: &str =
    "request_id, level, description, action, status, created_at, resolved_at";

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Problem Queue ─────────────────────────────────────────────────────

    pub fn enqueue_problem(&self, report: &ProblemReport) -> Result<i64> {
        let payload = serde_json::to_string(report).context("serialize problem report")?;
        self.enqueue_raw(&payload)
    }

    /// Enqueue a payload verbatim. Validation happens on dequeue.
    pub fn enqueue_raw(&self, payload: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO problem_queue (payload, enqueued_at) VALUES (?1, ?2)",
            params![payload, now_str()],
        )
        .context("enqueue_raw")?;
        Ok(conn.last_insert_rowid())
    }

    /// Pop the oldest payload, if any.
    pub fn dequeue_raw(&self) -> Result<Option<String>> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("dequeue_raw begin")?;
        let head: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, payload FROM problem_queue ORDER BY id ASC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .context("dequeue_raw select")?;
        let Some((id, payload)) = head else {
            return Ok(None);
        };
        tx.execute("DELETE FROM problem_queue WHERE id = ?1", params![id])
            .context("dequeue_raw delete")?;
        tx.commit().context("dequeue_raw commit")?;
        Ok(Some(payload))
    }

    pub fn queue_depth(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT COUNT(*) FROM problem_queue", [], |r| r.get(0))
            .context("queue_depth")
    }

    // ── Approval Requests ─────────────────────────────────────────────────

    /// Store a pending request. It stays readable for `pending_for` and, once
    /// resolved, for `decision_ttl` after the resolution.
    pub fn create_approval_request(
        &self,
        request_id: &str,
        level: RepairLevel,
        description: &str,
        action: RepairAction,
        pending_for: Duration,
        decision_ttl: Duration,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = secs(decision_ttl);
        let expires_at = now_unix()
            .saturating_add(secs(pending_for))
            .saturating_add(ttl);
        conn.execute(
            "INSERT INTO approval_requests \
             (request_id, level, description, action, status, created_at, expires_at, decision_ttl_s) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
            params![
                request_id,
                level.as_u8(),
                description,
                action.as_str(),
                now_str(),
                expires_at,
                ttl
            ],
        )
        .context("create_approval_request")?;
        Ok(())
    }

    /// Record an operator decision. Only a live pending request transitions;
    /// returns `false` for duplicates, late clicks and unknown ids.
    pub fn resolve_approval(&self, request_id: &str, approved: bool) -> Result<bool> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.transition_pending(request_id, status)
    }

    /// Close a request the gate stopped waiting for, so later clicks are no-ops.
    pub fn mark_approval_timed_out(&self, request_id: &str) -> Result<bool> {
        self.transition_pending(request_id, ApprovalStatus::TimedOut)
    }

    fn transition_pending(&self, request_id: &str, status: ApprovalStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_unix();
        let changed = conn
            .execute(
                "UPDATE approval_requests \
                 SET status = ?1, resolved_at = ?2, expires_at = ?3 + decision_ttl_s \
                 WHERE request_id = ?4 AND status = 'pending' AND expires_at > ?3",
                params![status.as_str(), now_str(), now, request_id],
            )
            .context("transition_pending")?;
        Ok(changed == 1)
    }

    pub fn get_approval_status(&self, request_id: &str) -> Result<Option<ApprovalStatus>> {
        Ok(self
            .get_approval_request(request_id)?
            .map(|r| r.status))
    }

    pub fn get_approval_request(&self, request_id: &str) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!(
                "SELECT {APPROVAL_COLUMNS} FROM approval_requests \
                 WHERE request_id = ?1 AND expires_at > ?2"
            ),
            params![request_id, now_unix()],
            row_to_approval,
        )
        .optional()
        .context("get_approval_request")
    }

    pub fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_requests \
             WHERE status = 'pending' AND expires_at > ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![now_unix()], row_to_approval)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_pending_approvals")?;
        Ok(rows)
    }

    pub fn purge_expired_approvals(&self) -> Result<usize> {
        self.purge_expired_approvals_at(now_unix())
    }

    /// Delete rows whose expiry (unix seconds) is at or before `now`.
    pub fn purge_expired_approvals_at(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM approval_requests WHERE expires_at <= ?1",
            params![now],
        )
        .context("purge_expired_approvals")
    }

    // ── Repair Log ────────────────────────────────────────────────────────

    /// Append a record and trim the log to the newest `cap` entries.
    pub fn append_repair_record(&self, record: &RepairRecord, cap: usize) -> Result<()> {
        let json = serde_json::to_string(record).context("serialize repair record")?;
        let outcome = serde_json::to_value(record.result.outcome)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("append_repair_record begin")?;
        tx.execute(
            "INSERT INTO repair_log (check_name, outcome, record, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![record.check, outcome, json, now_str()],
        )
        .context("append_repair_record insert")?;
        tx.execute(
            "DELETE FROM repair_log WHERE id NOT IN \
             (SELECT id FROM repair_log ORDER BY id DESC LIMIT ?1)",
            params![i64::try_from(cap).unwrap_or(i64::MAX)],
        )
        .context("append_repair_record trim")?;
        tx.commit().context("append_repair_record commit")?;
        Ok(())
    }

    /// The newest `limit` records, oldest first. Unparseable rows are skipped.
    pub fn recent_repair_records(&self, limit: usize) -> Result<Vec<RepairRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT record FROM \
             (SELECT id, record FROM repair_log ORDER BY id DESC LIMIT ?1) \
             ORDER BY id ASC",
        )?;
        let raw = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |r| {
                r.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent_repair_records")?;
        Ok(raw
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }

    pub fn repair_log_len(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT COUNT(*) FROM repair_log", [], |r| r.get(0))
            .context("repair_log_len")
    }
}
