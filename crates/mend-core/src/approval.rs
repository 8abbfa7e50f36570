use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{
    db::Db,
    notify::{Button, Notification, Notifier},
    telegram::{CALLBACK_APPROVE, CALLBACK_DETAILS, CALLBACK_REJECT},
    types::{ActionDetails, ApprovalStatus, RepairAction, RepairLevel},
};

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_APPROVAL_POLL: Duration = Duration::from_secs(2);
pub const DEFAULT_DECISION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalOutcome {
    pub fn is_approved(self) -> bool {
        self == Self::Approved
    }
}

/// Asks the operator to decide and blocks until the store holds an answer.
pub struct ApprovalGate {
    db: Arc<Db>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    poll_interval: Duration,
    decision_ttl: Duration,
}

pub fn new_request_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

impl ApprovalGate {
    pub fn new(
        db: Arc<Db>,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
        poll_interval: Duration,
        decision_ttl: Duration,
    ) -> Self {
        Self {
            db,
            notifier,
            timeout,
            poll_interval,
            decision_ttl,
        }
    }

    pub async fn request_approval(
        &self,
        level: RepairLevel,
        description: &str,
        action: RepairAction,
        details: &ActionDetails,
    ) -> ApprovalOutcome {
        self.request_approval_with(level, description, action, details, |_| {})
            .await
    }

    /// Like [`Self::request_approval`], calling `on_created` with the request id
    /// once the request is stored and sent.
    pub async fn request_approval_with(
        &self,
        level: RepairLevel,
        description: &str,
        action: RepairAction,
        details: &ActionDetails,
        on_created: impl FnOnce(&str),
    ) -> ApprovalOutcome {
        let request_id = new_request_id();

        if let Err(e) = self.db.create_approval_request(
            &request_id,
            level,
            description,
            action,
            self.timeout,
            self.decision_ttl,
        ) {
            // Without a stored row no decision can ever land.
            warn!(request_id, "failed to store approval request: {e:#}");
            let text = format!(
                "⚠️ Approval request could not be stored, repair skipped.\nProblem: {description}\nAction: {action}"
            );
            if let Err(e) = self.notifier.send(&Notification::text(text)).await {
                warn!(request_id, "store failure notification failed: {e:#}");
            }
            return ApprovalOutcome::TimedOut;
        }

        let notification = Notification::text(approval_text(
            &request_id,
            level,
            description,
            action,
            details,
            self.timeout,
        ))
            .with_buttons(vec![
                Button::new("✅ Approve", format!("{CALLBACK_APPROVE}:{request_id}")),
                Button::new("❌ Reject", format!("{CALLBACK_REJECT}:{request_id}")),
                Button::new("ℹ️ Details", format!("{CALLBACK_DETAILS}:{request_id}")),
            ]);
        if let Err(e) = self.notifier.send(&notification).await {
            warn!(request_id, "approval request notification failed: {e:#}");
        }
        info!(request_id, level = level.as_u8(), action = %action, "awaiting approval");
        on_created(&request_id);

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.db.get_approval_status(&request_id) {
                Ok(Some(ApprovalStatus::Approved)) => {
                    info!(request_id, "approval granted");
                    return ApprovalOutcome::Approved;
                }
                Ok(Some(ApprovalStatus::Rejected)) => {
                    info!(request_id, "approval rejected");
                    return ApprovalOutcome::Rejected;
                }
                Ok(Some(ApprovalStatus::TimedOut)) => return ApprovalOutcome::TimedOut,
                Ok(Some(ApprovalStatus::Pending)) | Ok(None) => {}
                Err(e) => warn!(request_id, "approval poll failed: {e:#}"),
            }

            if Instant::now() >= deadline {
                return self.expire(&request_id, description).await;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn expire(&self, request_id: &str, description: &str) -> ApprovalOutcome {
        match self.db.mark_approval_timed_out(request_id) {
            Ok(true) => {}
            Ok(false) => {
                // A decision landed between the last poll and the deadline.
                match self.db.get_approval_status(request_id) {
                    Ok(Some(ApprovalStatus::Approved)) => return ApprovalOutcome::Approved,
                    Ok(Some(ApprovalStatus::Rejected)) => return ApprovalOutcome::Rejected,
                    _ => {}
                }
            }
            Err(e) => warn!(request_id, "failed to close timed-out request: {e:#}"),
        }

        warn!(request_id, "approval timed out");
        let text = format!(
            "⏰ No decision on request {request_id} after {} min, skipping.\n{description}",
            self.timeout.as_secs() / 60
        );
        if let Err(e) = self.notifier.send(&Notification::text(text)).await {
            warn!(request_id, "timeout notification failed: {e:#}");
        }
        ApprovalOutcome::TimedOut
    }
}

fn approval_text(
    request_id: &str,
    level: RepairLevel,
    description: &str,
    action: RepairAction,
    details: &ActionDetails,
    timeout: Duration,
) -> String {
    let mut text = format!(
        "🔧 Repair approval needed [{}]\n\nProblem: {description}\nAction: {action}\nRequest: {request_id}",
        level.label()
    );
    if let Some(target) = &details.target {
        text.push_str(&format!("\nTarget: {target}"));
    }
    text.push_str(&format!("\nTimeout: {} min", timeout.as_secs() / 60));
    text
}

/// Reply body for the details button.
pub fn details_text(db: &Db, request_id: &str) -> String {
    match db.get_approval_request(request_id) {
        Ok(Some(req)) => format!(
            "Request {}\nLevel: {} ({})\nAction: {}\nStatus: {}\nCreated: {}\n\n{}",
            req.request_id,
            req.level.as_u8(),
            req.level.label(),
            req.action,
            req.status.as_str(),
            req.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            req.description
        ),
        Ok(None) => format!("Request {request_id} not found or expired"),
        Err(e) => format!("Failed to load request {request_id}: {e:#}"),
    }
}
