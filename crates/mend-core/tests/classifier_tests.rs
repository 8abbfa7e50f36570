use mend_core::{
    classifier::Classifier,
    rules::{self, REPAIR_RULES},
    CheckStatus, CleanupStep, ProblemType, RepairAction, RepairLevel,
};

// ── Rule matching ────────────────────────────────────────────────────────

#[test]
fn service_check_restarts_mapped_service() {
    let mut c = Classifier::default();
    let plan = c
        .classify("Service:app-gateway", CheckStatus::Critical, "inactive")
        .expect("plan");
    assert_eq!(plan.problem_type, ProblemType::ServiceDown);
    assert_eq!(plan.level, RepairLevel::Auto);
    assert_eq!(plan.action, RepairAction::RestartService);
    assert_eq!(plan.details.target.as_deref(), Some("app-gateway"));
    assert_eq!(plan.source_check, "Service:app-gateway");
}

#[test]
fn dependency_check_restarts_its_container() {
    let mut c = Classifier::default();
    let plan = c.classify("Redis", CheckStatus::Critical, "refused").unwrap();
    assert_eq!(plan.problem_type, ProblemType::DependencyDown);
    assert_eq!(plan.action, RepairAction::RestartContainer);
    assert_eq!(plan.details.target.as_deref(), Some("app-redis"));
}

#[test]
fn disk_check_carries_ordered_cleanup_steps() {
    let mut c = Classifier::default();
    let plan = c.classify("Disk", CheckStatus::Warning, "91%").unwrap();
    assert_eq!(plan.action, RepairAction::CleanupDisk);
    assert_eq!(
        plan.details.steps,
        vec![
            CleanupStep::DockerPrune,
            CleanupStep::LogRotate,
            CleanupStep::TmpCleanup
        ]
    );
}

#[test]
fn first_matching_rule_wins() {
    let name = "Service:app-gateway";
    let first = REPAIR_RULES.iter().find(|r| r.matches(name)).unwrap();
    assert_eq!(rules::find_rule(name), Some(first));
    assert!(rules::find_rule("Disk /var").is_some(), "prefix match");
    assert!(rules::find_rule("Memcached").is_none());
}

#[test]
fn trailing_star_in_pattern_is_ignored() {
    let rule = rules::RepairRule {
        pattern: "Docker:*",
        ..REPAIR_RULES[4]
    };
    assert!(rule.matches("Docker:anything"));
    assert!(!rule.matches("Service:app-gateway"));
}

// ── Non-failing statuses ─────────────────────────────────────────────────

#[test]
fn ok_and_info_produce_no_plan_and_clear_counter() {
    let mut c = Classifier::default();
    c.classify("CPU", CheckStatus::Warning, "95%");
    c.classify("CPU", CheckStatus::Warning, "96%");
    assert_eq!(c.failure_count("CPU"), 2);

    assert!(c.classify("CPU", CheckStatus::Info, "idle").is_none());
    assert_eq!(c.failure_count("CPU"), 0);

    c.classify("CPU", CheckStatus::Warning, "97%");
    assert!(c.classify("CPU", CheckStatus::Ok, "20%").is_none());
    assert_eq!(c.failure_count("CPU"), 0);
}

// ── Escalation ───────────────────────────────────────────────────────────

#[test]
fn escalates_only_after_threshold_exceeded() {
    let mut c = Classifier::new(3);
    for i in 1..=3 {
        let plan = c.classify("Service:app-gateway", CheckStatus::Critical, "down").unwrap();
        assert_eq!(plan.level, RepairLevel::Auto, "failure {i} stays auto");
    }
    let plan = c
        .classify("Service:app-gateway", CheckStatus::Critical, "still down")
        .unwrap();
    assert_eq!(plan.level, RepairLevel::Cursor);
    assert_eq!(plan.action, RepairAction::CodeFixDiagnose);
    let ctx = plan.details.context.expect("context");
    assert!(ctx.contains('4'), "failure count in context: {ctx}");
    assert!(ctx.contains("still down"), "last value in context: {ctx}");
}

#[test]
fn reset_restarts_the_escalation_count() {
    let mut c = Classifier::new(1);
    c.classify("Disk", CheckStatus::Warning, "95%");
    c.reset_failure_count("Disk");
    let plan = c.classify("Disk", CheckStatus::Warning, "95%").unwrap();
    assert_eq!(plan.level, RepairLevel::Auto);
    assert_eq!(c.failure_count("Disk"), 1);
}

#[test]
fn counters_are_per_check() {
    let mut c = Classifier::new(1);
    c.classify("Redis", CheckStatus::Critical, "x");
    let plan = c.classify("PostgreSQL", CheckStatus::Critical, "x").unwrap();
    assert_eq!(plan.level, RepairLevel::Auto);
    assert_eq!(c.failure_count("Redis"), 1);
}

// ── Fallbacks ────────────────────────────────────────────────────────────

#[test]
fn agent_checks_need_approval_to_investigate() {
    let mut c = Classifier::default();
    let plan = c
        .classify("Agent:sales-bot", CheckStatus::Critical, "no heartbeat")
        .unwrap();
    assert_eq!(plan.problem_type, ProblemType::AgentError);
    assert_eq!(plan.level, RepairLevel::Approve);
    assert_eq!(plan.action, RepairAction::InvestigateAgent);
    assert_eq!(plan.details.target.as_deref(), Some("sales-bot"));
}

#[test]
fn unknown_checks_are_escalated_not_dropped() {
    let mut c = Classifier::default();
    let plan = c
        .classify("Certificate expiry", CheckStatus::Warning, "5 days")
        .unwrap();
    assert_eq!(plan.problem_type, ProblemType::Unknown);
    assert_eq!(plan.level, RepairLevel::Approve);
    assert_eq!(plan.action, RepairAction::NotifyAdmin);
    assert!(plan.description.starts_with("Unknown issue:"));
    assert_eq!(c.failure_count("Certificate expiry"), 0);
}

#[test]
fn repeated_identical_reports_count_up_monotonically() {
    let mut c = Classifier::new(100);
    for expected in 1..=6 {
        c.classify("RAM", CheckStatus::Warning, "92%");
        assert_eq!(c.failure_count("RAM"), expected);
    }
}
