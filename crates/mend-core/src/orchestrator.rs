use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    approval::{ApprovalGate, ApprovalOutcome},
    classifier::Classifier,
    codefix::{CodeFixBackend, CodeFixBridge, JobStatus, LaunchOutcome},
    command::CommandRunner,
    config::Config,
    db::Db,
    executor::{ActionBudget, Executor},
    health::HealthSource,
    notify::{Notification, Notifier},
    rules,
    types::{
        CheckResult, ProblemReport, Refusal, RepairEvent, RepairLevel, RepairOutcome, RepairPlan,
        RepairRecord, RepairResult,
    },
    verifier::{Verifier, VerifyOutcome},
};

/// Records kept in memory for status reporting.
pub const HISTORY_CAP: usize = 100;

const ERROR_BACKOFF: Duration = Duration::from_secs(10);
const LOG_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_RECENT: usize = 10;

/// External collaborators the agent is wired to.
pub struct AgentDeps {
    pub db: Arc<Db>,
    pub runner: Arc<dyn CommandRunner>,
    pub health: Arc<dyn HealthSource>,
    pub notifier: Arc<dyn Notifier>,
    pub codefix: Arc<dyn CodeFixBackend>,
}

/// The repair control loop: dequeue a report, classify it, fix / ask / escalate,
/// verify, record.
pub struct RepairAgent {
    db: Arc<Db>,
    classifier: Classifier,
    executor: Executor,
    verifier: Verifier,
    approvals: ApprovalGate,
    codefix: CodeFixBridge,
    notifier: Arc<dyn Notifier>,
    runner: Arc<dyn CommandRunner>,
    config: Config,
    history: VecDeque<RepairRecord>,
    events: broadcast::Sender<RepairEvent>,
}

impl RepairAgent {
    pub fn new(config: Config, deps: AgentDeps) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            classifier: Classifier::new(config.escalation_threshold),
            executor: Executor::new(Arc::clone(&deps.runner), config.max_actions_per_hour),
            verifier: Verifier::new(deps.health, Arc::clone(&deps.runner), config.verify_delay),
            approvals: ApprovalGate::new(
                Arc::clone(&deps.db),
                Arc::clone(&deps.notifier),
                config.approval_timeout,
                config.approval_poll,
                config.decision_ttl,
            ),
            codefix: CodeFixBridge::new(deps.codefix, config.codefix_poll)
                .with_daily_limit(config.codefix_max_per_day),
            db: deps.db,
            notifier: deps.notifier,
            runner: deps.runner,
            config,
            history: VecDeque::with_capacity(HISTORY_CAP),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepairEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<RepairEvent> {
        self.events.clone()
    }

    pub fn budget(&self) -> ActionBudget {
        self.executor.budget()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn history(&self) -> &VecDeque<RepairRecord> {
        &self.history
    }

    pub fn status(&self) -> String {
        let records: Vec<RepairRecord> = self.history.iter().cloned().collect();
        let budget = self.executor.budget();
        format_status(&records, budget.used(), budget.limit())
    }

    /// Run until `cancel` fires. An in-flight cycle is abandoned on cancel.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("repair agent started");
        self.notify(format!(
            "🛠 Repair agent started\nTime: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ))
        .await;

        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.process_next() => r,
            };

            let pause = match step {
                Ok(true) => continue,
                Ok(false) => {
                    match self.db.purge_expired_approvals() {
                        Ok(0) => {}
                        Ok(n) => debug!(purged = n, "expired approval requests purged"),
                        Err(e) => warn!("approval purge failed: {e:#}"),
                    }
                    self.config.queue_poll
                }
                Err(e) => {
                    error!("repair loop error: {e:#}");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("repair agent stopped");
    }

    /// Handle at most one queued report. Returns whether the queue had one.
    pub async fn process_next(&mut self) -> Result<bool> {
        let Some(payload) = self.db.dequeue_raw()? else {
            return Ok(false);
        };
        match serde_json::from_str::<ProblemReport>(&payload) {
            Ok(report) => {
                self.handle_report(report).await;
            }
            Err(e) => warn!(payload = %payload, "dropping malformed problem report: {e}"),
        }
        Ok(true)
    }

    /// One full repair cycle. Returns the record written, or `None` when the
    /// report needed no action.
    pub async fn handle_report(&mut self, report: ProblemReport) -> Option<RepairRecord> {
        info!(
            check = %report.name,
            status = %report.status,
            value = %report.value,
            "processing problem report"
        );

        let plan = match self
            .classifier
            .classify(&report.name, report.status, &report.value)
        {
            Some(plan) => plan,
            None => {
                debug!(check = %report.name, "no action needed");
                return None;
            }
        };

        let started_at = Utc::now();
        let _ = self.events.send(RepairEvent::Classified {
            check: plan.source_check.clone(),
            level: plan.level,
            action: plan.action,
        });

        let result = match plan.level {
            RepairLevel::Auto => self.handle_auto(&plan).await,
            RepairLevel::Approve => self.handle_approve(&plan).await,
            RepairLevel::Cursor => self.handle_codefix(&plan).await,
        };

        let record = RepairRecord {
            check: report.name,
            status: report.status,
            level: plan.level,
            action: plan.action,
            started_at,
            completed_at: Utc::now(),
            result,
        };
        self.finish(record.clone());
        Some(record)
    }

    async fn handle_auto(&mut self, plan: &RepairPlan) -> RepairResult {
        info!(check = %plan.source_check, action = %plan.action, "auto repair");
        let pre = self.pre_state(plan).await;
        self.execute_and_verify(plan, pre).await
    }

    async fn handle_approve(&mut self, plan: &RepairPlan) -> RepairResult {
        info!(check = %plan.source_check, action = %plan.action, "repair needs approval");
        if let Some(denied) = self.await_decision(plan, &plan.description).await {
            return denied;
        }

        if plan.action.is_informational() {
            info!(check = %plan.source_check, "operator acknowledged");
            return RepairResult::new(true, "Acknowledged by operator", RepairOutcome::Succeeded);
        }

        let pre = self.pre_state(plan).await;
        self.execute_and_verify(plan, pre).await
    }

    async fn handle_codefix(&mut self, plan: &RepairPlan) -> RepairResult {
        let failures = self.classifier.failure_count(&plan.source_check);
        info!(check = %plan.source_check, failures, "code fix escalation requested");

        let description = format!(
            "{}\nAction: AI code analysis and fix\nFailures: {failures}",
            plan.description
        );
        if let Some(denied) = self.await_decision(plan, &description).await {
            return denied;
        }

        let logs = self.service_logs(&plan.source_check).await;
        let context = plan.details.context.as_deref().unwrap_or("");

        let agent_id = match self.codefix.launch(&plan.description, &logs, context).await {
            LaunchOutcome::Launched { agent_id } => agent_id,
            LaunchOutcome::NotConfigured => {
                let msg = "Code-fix service not configured";
                self.notify(format!("❌ Code fix FAILED\nCheck: {}\n{msg}", plan.source_check))
                    .await;
                return RepairResult::new(false, msg, RepairOutcome::Failed);
            }
            LaunchOutcome::LimitReached { limit } => {
                let msg = format!("Daily code-fix limit reached ({limit}). Try again tomorrow.");
                self.notify(format!("⏳ Code fix skipped\nCheck: {}\n{msg}", plan.source_check))
                    .await;
                return RepairResult::new(false, msg, RepairOutcome::RateLimited);
            }
            LaunchOutcome::Failed(e) => {
                let msg = format!("Failed to launch code fix: {e}");
                self.notify(format!("❌ Code fix FAILED\nCheck: {}\n{msg}", plan.source_check))
                    .await;
                return RepairResult::new(false, msg, RepairOutcome::Failed);
            }
        };

        self.notify(format!(
            "🤖 Code-fix job launched: {agent_id}\nProblem: {}\nWaiting for completion...",
            plan.source_check
        ))
        .await;

        let job = self
            .codefix
            .wait_for_completion(&agent_id, self.config.codefix_timeout)
            .await;

        match job.status {
            JobStatus::Completed => {
                self.notify(format!(
                    "✅ Code-fix job completed: {agent_id}\n\
                     A pull request should be available for review. \
                     Deploy the change after review."
                ))
                .await;
                RepairResult::new(
                    true,
                    format!("Code-fix job {agent_id} completed"),
                    RepairOutcome::Succeeded,
                )
            }
            JobStatus::TimedOut => {
                self.notify(format!(
                    "⏰ Code-fix job {agent_id} did not finish within {} min; it keeps running remotely.",
                    self.config.codefix_timeout.as_secs() / 60
                ))
                .await;
                RepairResult::new(
                    false,
                    format!("Code-fix job {agent_id} timed out"),
                    RepairOutcome::TimedOut,
                )
            }
            _ => {
                let err = job.error.unwrap_or_else(|| "job failed".to_string());
                self.notify(format!("❌ Code-fix job FAILED: {agent_id}\nError: {err}"))
                    .await;
                RepairResult::new(
                    false,
                    format!("Code-fix job {agent_id} failed: {err}"),
                    RepairOutcome::Failed,
                )
            }
        }
    }

    /// `None` when approved; otherwise the terminal result for the cycle.
    async fn await_decision(&mut self, plan: &RepairPlan, description: &str) -> Option<RepairResult> {
        let events = self.events.clone();
        let check = plan.source_check.clone();
        let outcome = self
            .approvals
            .request_approval_with(plan.level, description, plan.action, &plan.details, |id| {
                let _ = events.send(RepairEvent::AwaitingApproval {
                    check,
                    request_id: id.to_string(),
                });
            })
            .await;

        match outcome {
            ApprovalOutcome::Approved => None,
            ApprovalOutcome::Rejected => {
                info!(check = %plan.source_check, "repair rejected by operator");
                self.notify(format!(
                    "🚫 Repair rejected\nCheck: {}\nAction: {}",
                    plan.source_check, plan.action
                ))
                .await;
                Some(RepairResult::new(false, "Rejected by operator", RepairOutcome::Rejected))
            }
            // The gate already told the operator.
            ApprovalOutcome::TimedOut => Some(RepairResult::new(
                false,
                "Approval timed out",
                RepairOutcome::TimedOut,
            )),
        }
    }

    async fn pre_state(&self, plan: &RepairPlan) -> Option<Vec<CheckResult>> {
        if !plan.action.needs_verification() {
            return None;
        }
        match self.verifier.get_current_state().await {
            Ok(checks) => Some(checks),
            Err(e) => {
                warn!(check = %plan.source_check, "pre-repair sweep failed: {e:#}");
                None
            }
        }
    }

    async fn execute_and_verify(
        &mut self,
        plan: &RepairPlan,
        pre: Option<Vec<CheckResult>>,
    ) -> RepairResult {
        let check = &plan.source_check;
        let result = self.executor.execute(plan.action, &plan.details).await;

        match result.refusal {
            Some(Refusal::RateLimited) => {
                self.notify(format!(
                    "⏳ Repair skipped\nCheck: {check}\nAction: {}\n{}",
                    plan.action, result.message
                ))
                .await;
                return RepairResult::new(false, result.message, RepairOutcome::RateLimited);
            }
            Some(_) => {
                self.notify(format!(
                    "🚫 Repair refused\nCheck: {check}\nAction: {}\n{}",
                    plan.action, result.message
                ))
                .await;
                return RepairResult::new(false, result.message, RepairOutcome::Refused);
            }
            None => {}
        }

        if !result.success {
            let detail = if result.output.is_empty() {
                result.message.clone()
            } else {
                format!("{}: {}", result.message, result.output)
            };
            self.notify(format!(
                "❌ Repair FAILED\nCheck: {check}\nAction: {}\nError: {detail}",
                plan.action
            ))
            .await;
            return RepairResult::new(false, result.message, RepairOutcome::Failed);
        }

        if !plan.action.needs_verification() {
            self.notify(format!(
                "Repair [OK]\nCheck: {check}\nAction: {}\nResult: {}",
                plan.action, result.message
            ))
            .await;
            return RepairResult::new(true, result.message, RepairOutcome::Succeeded);
        }

        let verification = self.verifier.verify(check, pre.as_deref()).await;
        match verification.outcome {
            VerifyOutcome::Resolved => {
                self.classifier.reset_failure_count(check);
                self.notify(format!(
                    "✅ Repair SUCCESS\nCheck: {check}\nAction: {}\nVerification: {}",
                    plan.action, verification.message
                ))
                .await;
                RepairResult::new(true, verification.message, RepairOutcome::Succeeded)
            }
            VerifyOutcome::Regressed => {
                self.notify(format!(
                    "⚠️ Repair WARNING\nCheck: {check} - action: {}\nNew problems: {}\nManual investigation required!",
                    plan.action,
                    verification.new_problems.join(", ")
                ))
                .await;
                RepairResult::new(false, verification.message, RepairOutcome::Regressed)
            }
            VerifyOutcome::Persisted => {
                self.notify(format!(
                    "❌ Repair FAILED\nCheck: {check}\nAction: {} did not resolve the issue.\nWill escalate on next cycle.",
                    plan.action
                ))
                .await;
                RepairResult::new(false, verification.message, RepairOutcome::Persisted)
            }
        }
    }

    /// Recent logs of the unit behind `check`, for the code-fix prompt.
    pub async fn service_logs(&self, check: &str) -> String {
        let res = if let Some(svc) = rules::service_for_check(check) {
            self.runner
                .run(
                    "journalctl",
                    &["-u", svc, "-n", "100", "--no-pager"],
                    LOG_FETCH_TIMEOUT,
                )
                .await
        } else if let Some(container) = rules::container_for_check(check) {
            self.runner
                .run("docker", &["logs", "--tail", "100", container], LOG_FETCH_TIMEOUT)
                .await
        } else {
            return String::new();
        };

        match res {
            Ok(out) => out.combined_output(),
            Err(e) => {
                warn!(check, "failed to fetch service logs: {e:#}");
                format!("Failed to get logs: {e:#}")
            }
        }
    }

    fn finish(&mut self, record: RepairRecord) {
        info!(
            check = %record.check,
            action = %record.action,
            outcome = ?record.result.outcome,
            success = record.result.success,
            "repair cycle finished"
        );
        if let Err(e) = self.db.append_repair_record(&record, self.config.repair_log_cap) {
            warn!("failed to persist repair record: {e:#}");
        }
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        let _ = self.events.send(RepairEvent::Completed { record });
    }

    async fn notify(&self, text: String) {
        if let Err(e) = self.notifier.send(&Notification::text(text)).await {
            warn!("notification failed: {e:#}");
        }
    }
}

/// Human-readable summary of recent repairs, newest first.
pub fn format_status(records: &[RepairRecord], actions_in_window: usize, limit: usize) -> String {
    let mut lines = vec![
        "Repair Agent Status".to_string(),
        format!("Total repairs: {}", records.len()),
        format!("Rate limit: {actions_in_window}/{limit} per hour"),
        String::new(),
    ];

    if records.is_empty() {
        lines.push("No repairs performed yet.".to_string());
        return lines.join("\n");
    }

    lines.push("Recent repairs:".to_string());
    for r in records.iter().rev().take(STATUS_RECENT) {
        let icon = if r.result.success { "OK" } else { "FAIL" };
        lines.push(format!(
            "  [{icon}] {} - L{} {} ({})",
            r.check,
            r.level.as_u8(),
            r.action,
            r.started_at.format("%Y-%m-%d %H:%M")
        ));
    }
    lines.join("\n")
}
