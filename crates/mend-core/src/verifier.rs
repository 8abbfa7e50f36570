use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    command::CommandRunner,
    health::HealthSource,
    rules,
    types::{ActionResult, CheckResult, Refusal},
};

pub const DEFAULT_VERIFY_DELAY: Duration = Duration::from_secs(30);

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    Resolved,
    /// The original check cleared but other checks began failing.
    Regressed,
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub success: bool,
    pub original_resolved: bool,
    pub new_problems: Vec<String>,
    pub message: String,
    pub outcome: VerifyOutcome,
}

pub struct Verifier {
    health: Arc<dyn HealthSource>,
    runner: Arc<dyn CommandRunner>,
    settle_delay: Duration,
}

impl Verifier {
    pub fn new(
        health: Arc<dyn HealthSource>,
        runner: Arc<dyn CommandRunner>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            health,
            runner,
            settle_delay,
        }
    }

    /// Sweep immediately, without the settle delay.
    pub async fn get_current_state(&self) -> Result<Vec<CheckResult>> {
        self.health.run_all().await
    }

    /// Wait for the system to settle, then judge the repair of `check_name`
    /// against the pre-repair sweep.
    pub async fn verify(&self, check_name: &str, pre: Option<&[CheckResult]>) -> Verification {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let post = match self.health.run_all().await {
            Ok(checks) => checks,
            Err(e) => {
                warn!(check = check_name, "post-repair health sweep failed: {e:#}");
                return Verification {
                    success: false,
                    original_resolved: false,
                    new_problems: Vec::new(),
                    message: format!("Verification sweep failed: {e:#}"),
                    outcome: VerifyOutcome::Persisted,
                };
            }
        };

        let original_resolved = post
            .iter()
            .any(|c| c.name == check_name && !c.status.is_failing());

        let new_problems: Vec<String> = match pre {
            Some(pre) => {
                let before = failing_names(pre);
                failing_names(&post)
                    .difference(&before)
                    .map(|s| s.to_string())
                    .collect()
            }
            None => Vec::new(),
        };

        let (success, outcome, message) = match (original_resolved, new_problems.is_empty()) {
            (true, true) => (
                true,
                VerifyOutcome::Resolved,
                format!("{check_name} resolved"),
            ),
            (true, false) => (
                false,
                VerifyOutcome::Regressed,
                format!(
                    "Repair succeeded but introduced regressions: {}",
                    new_problems.join(", ")
                ),
            ),
            (false, _) => (
                false,
                VerifyOutcome::Persisted,
                format!("{check_name} still failing"),
            ),
        };

        info!(
            check = check_name,
            outcome = ?outcome,
            new_problems = new_problems.len(),
            "verification finished"
        );

        Verification {
            success,
            original_resolved,
            new_problems,
            message,
            outcome,
        }
    }

    /// Stop (not restart) a service that a repair destabilized.
    pub async fn rollback_service(&self, name: &str) -> ActionResult {
        if let Err(refused) = check_rollback_name(name, rules::is_allowed_service, false) {
            return refused;
        }
        warn!(service = name, "emergency rollback: stopping service");
        self.stop("systemctl", &["--user", "stop", name], name).await
    }

    pub async fn rollback_container(&self, name: &str) -> ActionResult {
        if let Err(refused) = check_rollback_name(name, rules::is_allowed_container, true) {
            return refused;
        }
        warn!(container = name, "emergency rollback: stopping container");
        self.stop("docker", &["stop", name], name).await
    }

    async fn stop(&self, program: &str, args: &[&str], name: &str) -> ActionResult {
        match self.runner.run(program, args, STOP_TIMEOUT).await {
            Ok(out) if out.success() => {
                ActionResult::ok(format!("Stopped {name}"), out.combined_output())
            }
            Ok(out) => ActionResult::failed(format!("Failed to stop {name}"), out.combined_output()),
            Err(e) => {
                error!(unit = name, "rollback command errored: {e:#}");
                ActionResult::failed(format!("Failed to stop {name}"), format!("{e:#}"))
            }
        }
    }
}

fn failing_names(checks: &[CheckResult]) -> BTreeSet<&str> {
    checks
        .iter()
        .filter(|c| c.status.is_failing())
        .map(|c| c.name.as_str())
        .collect()
}

/// `[A-Za-z0-9][A-Za-z0-9._-]*`, plus `/` for container references.
pub fn is_valid_unit_name(name: &str, allow_slash: bool) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && chars.all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') || (allow_slash && c == '/')
        })
}

fn check_rollback_name(
    name: &str,
    allowed: fn(&str) -> bool,
    allow_slash: bool,
) -> Result<(), ActionResult> {
    if !is_valid_unit_name(name, allow_slash) {
        error!(name = %name.escape_debug(), "rollback refused: malformed name");
        return Err(ActionResult::refused(
            Refusal::InvalidName,
            format!("Invalid name: {:?}", name),
        ));
    }
    if !allowed(name) {
        error!(name, "rollback refused: not in allow-list");
        return Err(ActionResult::refused(
            Refusal::NotAllowed,
            format!("{name} is not in the allow-list"),
        ));
    }
    Ok(())
}
