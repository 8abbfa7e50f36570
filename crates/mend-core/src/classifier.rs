use std::collections::HashMap;

use tracing::{info, warn};

use crate::{
    rules::{self, RepairRule},
    types::{
        ActionDetails, CheckStatus, CleanupStep, ProblemType, RepairAction, RepairLevel,
        RepairPlan,
    },
};

pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 3;

/// Rule-based classification of failing checks into repair plans.
///
/// Owns the per-check failure counters. A counter only exists while its check
/// is failing; it is the sole trigger for escalating an AUTO rule to CURSOR.
pub struct Classifier {
    failure_counts: HashMap<String, u32>,
    escalation_threshold: u32,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_ESCALATION_THRESHOLD)
    }
}

impl Classifier {
    pub fn new(escalation_threshold: u32) -> Self {
        Self {
            failure_counts: HashMap::new(),
            escalation_threshold,
        }
    }

    /// Returns `None` when the check is healthy (and clears its counter).
    pub fn classify(&mut self, check_name: &str, status: CheckStatus, value: &str) -> Option<RepairPlan> {
        if !status.is_failing() {
            self.failure_counts.remove(check_name);
            return None;
        }

        if let Some(rule) = rules::find_rule(check_name) {
            return Some(self.plan_from_rule(rule, check_name, value));
        }

        if let Some(agent) = check_name.strip_prefix(rules::AGENT_CHECK_PREFIX) {
            return Some(RepairPlan {
                problem_type: ProblemType::AgentError,
                level: RepairLevel::Approve,
                source_check: check_name.to_string(),
                description: format!("{check_name}: {value}"),
                action: RepairAction::InvestigateAgent,
                details: ActionDetails {
                    check_name: check_name.to_string(),
                    value: value.to_string(),
                    target: Some(agent.to_string()),
                    ..Default::default()
                },
            });
        }

        warn!(check = %check_name, status = %status, "no repair rule for check");
        Some(RepairPlan {
            problem_type: ProblemType::Unknown,
            level: RepairLevel::Approve,
            source_check: check_name.to_string(),
            description: format!("Unknown issue: {check_name}: {value}"),
            action: RepairAction::NotifyAdmin,
            details: ActionDetails {
                check_name: check_name.to_string(),
                value: value.to_string(),
                ..Default::default()
            },
        })
    }

    fn plan_from_rule(&mut self, rule: &RepairRule, check_name: &str, value: &str) -> RepairPlan {
        let count = {
            let c = self.failure_counts.entry(check_name.to_string()).or_insert(0);
            *c += 1;
            *c
        };

        let (level, action) = if rule.level == RepairLevel::Auto && count > self.escalation_threshold {
            warn!(
                check = %check_name,
                failures = count,
                "auto-repair keeps failing, escalating to code fix"
            );
            (RepairLevel::Cursor, RepairAction::CodeFixDiagnose)
        } else {
            (rule.level, rule.action)
        };

        let details = build_details(check_name, action, value, count);

        info!(
            check = %check_name,
            problem = rule.problem_type.as_str(),
            level = level.as_u8(),
            action = %action,
            failure_count = count,
            "problem classified"
        );

        RepairPlan {
            problem_type: rule.problem_type,
            level,
            source_check: check_name.to_string(),
            description: format!("{check_name}: {value}"),
            action,
            details,
        }
    }

    pub fn failure_count(&self, check_name: &str) -> u32 {
        self.failure_counts.get(check_name).copied().unwrap_or(0)
    }

    /// Clear the counter after a verified-successful repair.
    pub fn reset_failure_count(&mut self, check_name: &str) {
        self.failure_counts.remove(check_name);
    }
}

fn build_details(check_name: &str, action: RepairAction, value: &str, count: u32) -> ActionDetails {
    let mut details = ActionDetails {
        check_name: check_name.to_string(),
        value: value.to_string(),
        ..Default::default()
    };
    match action {
        RepairAction::RestartService => {
            details.target = rules::service_for_check(check_name).map(str::to_string);
        }
        RepairAction::RestartContainer => {
            details.target = rules::container_for_check(check_name).map(str::to_string);
        }
        RepairAction::CleanupDisk => {
            details.steps = vec![
                CleanupStep::DockerPrune,
                CleanupStep::LogRotate,
                CleanupStep::TmpCleanup,
            ];
        }
        RepairAction::CodeFixDiagnose => {
            details.context = Some(format!(
                "Check {check_name} has failed {count} times. \
                 Automatic repair did not help. Last observed value: {value}. \
                 Investigate the logs and fix the root cause."
            ));
        }
        RepairAction::LogAndWait | RepairAction::InvestigateAgent | RepairAction::NotifyAdmin => {}
    }
    details
}
