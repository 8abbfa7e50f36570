use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::{
    command::{run_with_privilege_fallback, CommandRunner, Privilege},
    rules,
    types::{ActionDetails, ActionResult, CleanupStep, Refusal, RepairAction},
};

pub const DEFAULT_MAX_ACTIONS_PER_HOUR: usize = 3;

const RATE_PERIOD: Duration = Duration::from_secs(3600);
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);
const DOCKER_TIMEOUT: Duration = Duration::from_secs(60);
const CLEANUP_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Sliding window of dispatch timestamps.
#[derive(Debug, Clone)]
pub struct RateWindow {
    limit: usize,
    period: Duration,
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(limit: usize, period: Duration) -> Self {
        Self {
            limit,
            period,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) >= self.period {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.stamps.len() < self.limit
    }

    pub fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }

    pub fn len(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.len()
    }

    pub fn is_empty(&mut self, now: Instant) -> bool {
        self.len(now) == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Read-only view of the executor's hourly budget for status reporting.
#[derive(Clone)]
pub struct ActionBudget {
    window: Arc<Mutex<RateWindow>>,
}

impl ActionBudget {
    pub fn used(&self) -> usize {
        let mut w = self.window.lock().unwrap_or_else(|e| e.into_inner());
        w.len(Instant::now())
    }

    pub fn limit(&self) -> usize {
        let w = self.window.lock().unwrap_or_else(|e| e.into_inner());
        w.limit()
    }
}

/// Runs allow-listed remediation commands under a global hourly budget.
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    window: Arc<Mutex<RateWindow>>,
}

impl Executor {
    pub fn new(runner: Arc<dyn CommandRunner>, max_actions_per_hour: usize) -> Self {
        Self::with_window(runner, RateWindow::new(max_actions_per_hour, RATE_PERIOD))
    }

    pub fn with_window(runner: Arc<dyn CommandRunner>, window: RateWindow) -> Self {
        Self {
            runner,
            window: Arc::new(Mutex::new(window)),
        }
    }

    pub fn budget(&self) -> ActionBudget {
        ActionBudget {
            window: Arc::clone(&self.window),
        }
    }

    pub fn actions_in_window(&self) -> usize {
        self.budget().used()
    }

    pub fn max_actions_per_hour(&self) -> usize {
        self.budget().limit()
    }

    /// Check the budget and, if there is room, spend one slot.
    fn try_consume(&self) -> Result<(), usize> {
        let mut w = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if !w.allow(now) {
            return Err(w.limit());
        }
        w.record(now);
        Ok(())
    }

    pub async fn execute(&self, action: RepairAction, details: &ActionDetails) -> ActionResult {
        if action == RepairAction::LogAndWait {
            info!(check = %details.check_name, value = %details.value, "resource pressure noted, waiting");
            return ActionResult::ok(
                format!("Logged {}: {}", details.check_name, details.value),
                "",
            );
        }

        // Validate before touching the budget so refusals cost nothing.
        let target = match action {
            RepairAction::RestartService => {
                match validate_target(details, rules::is_allowed_service, "service") {
                    Ok(t) => Some(t),
                    Err(refused) => return refused,
                }
            }
            RepairAction::RestartContainer => {
                match validate_target(details, rules::is_allowed_container, "container") {
                    Ok(t) => Some(t),
                    Err(refused) => return refused,
                }
            }
            RepairAction::CleanupDisk => None,
            other => {
                error!(action = %other, "executor asked to run a non-executable action");
                return ActionResult::refused(Refusal::UnknownAction, format!("Unknown action: {other}"));
            }
        };

        if let Err(limit) = self.try_consume() {
            warn!(action = %action, limit, "rate limit reached, refusing action");
            return ActionResult::refused(
                Refusal::RateLimited,
                format!("Rate limit exceeded: max {limit} actions per hour"),
            );
        }

        match (action, target) {
            (RepairAction::RestartService, Some(svc)) => self.restart_service(&svc).await,
            (RepairAction::RestartContainer, Some(c)) => self.restart_container(&c).await,
            _ => self.cleanup_disk(&details.steps).await,
        }
    }

    async fn restart_service(&self, service: &str) -> ActionResult {
        info!(service, "restarting service");
        let res = run_with_privilege_fallback(
            self.runner.as_ref(),
            "systemctl",
            &["--user", "restart", service],
            &["restart", service],
            SYSTEMCTL_TIMEOUT,
        )
        .await;

        match res {
            Ok(out) if out.output.success() => {
                let how = match out.privilege {
                    Privilege::User => "user unit",
                    Privilege::Sudo => "system unit",
                };
                info!(service, how, "service restarted");
                ActionResult::ok(
                    format!("Service {service} restarted ({how})"),
                    out.output.combined_output(),
                )
            }
            Ok(out) => {
                warn!(service, exit_code = out.output.exit_code, "service restart failed");
                ActionResult::failed(
                    format!("Failed to restart {service}"),
                    out.output.combined_output(),
                )
            }
            Err(e) => {
                warn!(service, "service restart errored: {e:#}");
                ActionResult::failed(format!("Failed to restart {service}"), format!("{e:#}"))
            }
        }
    }

    async fn restart_container(&self, container: &str) -> ActionResult {
        info!(container, "restarting container");
        match self
            .runner
            .run("docker", &["restart", container], DOCKER_TIMEOUT)
            .await
        {
            Ok(out) if out.success() => ActionResult::ok(
                format!("Container {container} restarted"),
                out.combined_output(),
            ),
            Ok(out) => {
                warn!(container, exit_code = out.exit_code, "container restart failed");
                ActionResult::failed(
                    format!("Failed to restart container {container}"),
                    out.combined_output(),
                )
            }
            Err(e) => {
                warn!(container, "container restart errored: {e:#}");
                ActionResult::failed(
                    format!("Failed to restart container {container}"),
                    format!("{e:#}"),
                )
            }
        }
    }

    /// Best effort: each step's result lands in the output, the action itself
    /// always reports success.
    async fn cleanup_disk(&self, steps: &[CleanupStep]) -> ActionResult {
        let steps: &[CleanupStep] = if steps.is_empty() {
            &[
                CleanupStep::DockerPrune,
                CleanupStep::LogRotate,
                CleanupStep::TmpCleanup,
            ]
        } else {
            steps
        };

        let mut lines = Vec::with_capacity(steps.len());
        for step in steps {
            let line = match self.cleanup_step(*step).await {
                Ok(text) => format!("{}: {}", step.as_str(), first_line_or(&text, "ok")),
                Err(text) => {
                    warn!(step = step.as_str(), "cleanup step failed: {text}");
                    format!("{}: failed: {}", step.as_str(), first_line_or(&text, "error"))
                }
            };
            lines.push(line);
        }

        info!(steps = steps.len(), "disk cleanup finished");
        ActionResult::ok("Disk cleanup completed", lines.join("\n"))
    }

    async fn cleanup_step(&self, step: CleanupStep) -> Result<String, String> {
        let res = match step {
            CleanupStep::DockerPrune => self
                .runner
                .run("docker", &["system", "prune", "-f"], CLEANUP_STEP_TIMEOUT)
                .await
                .map(|o| (o.success(), o.combined_output())),
            CleanupStep::LogRotate => run_with_privilege_fallback(
                self.runner.as_ref(),
                "journalctl",
                &["--user", "--vacuum-time=3d"],
                &["--vacuum-time=3d"],
                CLEANUP_STEP_TIMEOUT,
            )
            .await
            .map(|o| (o.output.success(), o.output.combined_output())),
            CleanupStep::TmpCleanup => self
                .runner
                .run(
                    "find",
                    &["/tmp", "-type", "f", "-mtime", "+7", "-delete"],
                    CLEANUP_STEP_TIMEOUT,
                )
                .await
                .map(|o| (o.success(), o.combined_output())),
        };
        match res {
            Ok((true, text)) => Ok(text),
            Ok((false, text)) => Err(text),
            Err(e) => Err(format!("{e:#}")),
        }
    }
}

fn validate_target(
    details: &ActionDetails,
    allowed: fn(&str) -> bool,
    kind: &str,
) -> Result<String, ActionResult> {
    let Some(target) = details.target.as_deref().filter(|t| !t.is_empty()) else {
        warn!(check = %details.check_name, kind, "no target resolved for restart");
        return Err(ActionResult::refused(
            Refusal::MissingTarget,
            format!("No {kind} mapped for {}", details.check_name),
        ));
    };
    if !allowed(target) {
        warn!(target, kind, "target not in allow-list, refusing");
        return Err(ActionResult::refused(
            Refusal::NotAllowed,
            format!("{kind} {target} is not in the allow-list"),
        ));
    }
    Ok(target.to_string())
}

fn first_line_or<'a>(text: &'a str, fallback: &'a str) -> &'a str {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(fallback)
}
