use std::time::Duration;

use chrono::Utc;
use mend_core::{
    db::Db, ApprovalStatus, CheckStatus, ProblemReport, RepairAction, RepairLevel, RepairOutcome,
    RepairRecord, RepairResult,
};

fn db() -> Db {
    let mut db = Db::open_in_memory().unwrap();
    db.migrate().unwrap();
    db
}

fn record(check: &str) -> RepairRecord {
    RepairRecord {
        check: check.to_string(),
        status: CheckStatus::Critical,
        level: RepairLevel::Auto,
        action: RepairAction::RestartContainer,
        started_at: Utc::now(),
        completed_at: Utc::now(),
        result: RepairResult::new(true, "ok", RepairOutcome::Succeeded),
    }
}

fn pending(db: &Db, id: &str) {
    db.create_approval_request(
        id,
        RepairLevel::Approve,
        "desc",
        RepairAction::NotifyAdmin,
        Duration::from_secs(1800),
        Duration::from_secs(3600),
    )
    .unwrap();
}

// ── Queue ────────────────────────────────────────────────────────────────

#[test]
fn queue_is_fifo() {
    let db = db();
    db.enqueue_problem(&ProblemReport::new("Redis", CheckStatus::Critical, "down"))
        .unwrap();
    db.enqueue_raw("{not json").unwrap();
    assert_eq!(db.queue_depth().unwrap(), 2);

    let first: ProblemReport = serde_json::from_str(&db.dequeue_raw().unwrap().unwrap()).unwrap();
    assert_eq!(first.name, "Redis");
    assert_eq!(db.dequeue_raw().unwrap().as_deref(), Some("{not json"));
    assert!(db.dequeue_raw().unwrap().is_none());
    assert_eq!(db.queue_depth().unwrap(), 0);
}

#[test]
fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mend.db");
    let path = path.to_str().unwrap();
    {
        let mut db = Db::open(path).unwrap();
        db.migrate().unwrap();
        db.enqueue_raw("{}").unwrap();
        pending(&db, "0000beef");
    }
    let mut db = Db::open(path).unwrap();
    db.migrate().unwrap();
    assert_eq!(db.queue_depth().unwrap(), 1);
    assert_eq!(db.get_approval_status("0000beef").unwrap(), Some(ApprovalStatus::Pending));
}

// ── Approvals ────────────────────────────────────────────────────────────

#[test]
fn first_decision_wins() {
    let db = db();
    pending(&db, "aaaa0001");
    assert!(db.resolve_approval("aaaa0001", false).unwrap());
    assert!(!db.resolve_approval("aaaa0001", true).unwrap());
    assert!(!db.mark_approval_timed_out("aaaa0001").unwrap());
    assert_eq!(db.get_approval_status("aaaa0001").unwrap(), Some(ApprovalStatus::Rejected));
    let req = db.get_approval_request("aaaa0001").unwrap().unwrap();
    assert!(req.resolved_at.is_some());
}

#[test]
fn unknown_ids_are_ignored() {
    let db = db();
    assert!(!db.resolve_approval("deadbeef", true).unwrap());
    assert_eq!(db.get_approval_status("deadbeef").unwrap(), None);
}

#[test]
fn pending_listing_excludes_resolved() {
    let db = db();
    pending(&db, "aaaa0001");
    pending(&db, "aaaa0002");
    db.resolve_approval("aaaa0001", true).unwrap();
    let ids: Vec<_> = db
        .list_pending_approvals()
        .unwrap()
        .into_iter()
        .map(|r| r.request_id)
        .collect();
    assert_eq!(ids, vec!["aaaa0002"]);
}

#[test]
fn expired_rows_are_invisible_and_purged() {
    let db = db();
    db.create_approval_request(
        "old00001",
        RepairLevel::Approve,
        "desc",
        RepairAction::NotifyAdmin,
        Duration::ZERO,
        Duration::ZERO,
    )
    .unwrap();
    pending(&db, "new00001");

    assert_eq!(db.get_approval_status("old00001").unwrap(), None);
    assert!(!db.resolve_approval("old00001", true).unwrap());

    assert_eq!(db.purge_expired_approvals().unwrap(), 1);
    // Far future: everything has expired.
    let later = Utc::now().timestamp() + 10 * 3600;
    assert_eq!(db.purge_expired_approvals_at(later).unwrap(), 1);
    assert!(db.list_pending_approvals().unwrap().is_empty());
}

// ── Repair log ───────────────────────────────────────────────────────────

#[test]
fn repair_log_is_capped_to_newest() {
    let db = db();
    for i in 0..7 {
        db.append_repair_record(&record(&format!("check-{i}")), 5).unwrap();
    }
    assert_eq!(db.repair_log_len().unwrap(), 5);
    let checks: Vec<_> = db
        .recent_repair_records(3)
        .unwrap()
        .into_iter()
        .map(|r| r.check)
        .collect();
    assert_eq!(checks, vec!["check-4", "check-5", "check-6"]);
}
